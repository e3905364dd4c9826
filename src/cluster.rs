//! Clustering engine.
//!
//! Groups fragments or lower-level summaries into clusters by embedding
//! similarity. Greedy centroid-based: each item joins the most similar
//! cluster above the similarity threshold (ties prefer the smaller
//! cluster, keeping sizes balanced); items matching nothing seed a new
//! singleton, so every input ends up in exactly one cluster.
//!
//! Clusters are never patched incrementally: a hierarchy build replaces
//! an owner's cluster set wholesale (see `summarize`).

use crate::config::ClusteringConfig;
use crate::embedding::cosine_similarity;

/// An in-memory cluster produced by [`cluster_vectors`]; ids refer to the
/// input items (fragment ids at level 0, cluster ids above).
#[derive(Debug, Clone)]
pub struct ClusterDraft {
    pub member_ids: Vec<String>,
    pub centroid: Vec<f32>,
}

/// Partition `items` into clusters.
///
/// Items are processed in input order, which makes the result
/// deterministic for a given fragment ordering.
pub fn cluster_vectors(items: &[(String, Vec<f32>)], config: &ClusteringConfig) -> Vec<ClusterDraft> {
    let mut clusters: Vec<ClusterDraft> = Vec::new();

    for (id, vector) in items {
        let mut best: Option<(usize, f32)> = None;

        for (idx, cluster) in clusters.iter().enumerate() {
            if cluster.member_ids.len() >= config.max_cluster_size {
                continue;
            }
            let sim = cosine_similarity(vector, &cluster.centroid);
            if sim < config.min_similarity {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_idx, best_sim)) => {
                    if (sim - best_sim).abs() < f32::EPSILON {
                        // Equal similarity: prefer the smaller cluster
                        clusters[idx].member_ids.len() < clusters[best_idx].member_ids.len()
                    } else {
                        sim > best_sim
                    }
                }
            };
            if better {
                best = Some((idx, sim));
            }
        }

        match best {
            Some((idx, _)) => {
                let cluster = &mut clusters[idx];
                let n = cluster.member_ids.len() as f32;
                // Running mean keeps the centroid derived from members
                for (c, v) in cluster.centroid.iter_mut().zip(vector.iter()) {
                    *c = (*c * n + v) / (n + 1.0);
                }
                cluster.member_ids.push(id.clone());
            }
            None => clusters.push(ClusterDraft {
                member_ids: vec![id.clone()],
                centroid: vector.clone(),
            }),
        }
    }

    clusters
}

/// Merge all drafts into a single cluster (used when the depth cap is hit
/// with more than one cluster remaining).
pub fn force_merge(drafts: Vec<ClusterDraft>) -> Option<ClusterDraft> {
    if drafts.is_empty() {
        return None;
    }
    let dims = drafts[0].centroid.len();
    let mut member_ids = Vec::new();
    let mut centroid = vec![0.0f32; dims];
    let mut weight = 0.0f32;

    for draft in drafts {
        let n = draft.member_ids.len() as f32;
        for (c, v) in centroid.iter_mut().zip(draft.centroid.iter()) {
            *c += v * n;
        }
        weight += n;
        member_ids.extend(draft.member_ids);
    }

    if weight > 0.0 {
        for c in centroid.iter_mut() {
            *c /= weight;
        }
    }

    Some(ClusterDraft { member_ids, centroid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(min_similarity: f32, max_cluster_size: usize) -> ClusteringConfig {
        ClusteringConfig {
            min_similarity,
            max_cluster_size,
        }
    }

    fn items(vectors: &[(&str, &[f32])]) -> Vec<(String, Vec<f32>)> {
        vectors
            .iter()
            .map(|(id, v)| (id.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_partition_invariant() {
        let input = items(&[
            ("a", &[1.0, 0.0]),
            ("b", &[0.9, 0.1]),
            ("c", &[0.0, 1.0]),
            ("d", &[0.1, 0.9]),
            ("e", &[-1.0, 0.0]),
        ]);
        let clusters = cluster_vectors(&input, &config(0.6, 8));

        let mut seen = HashSet::new();
        let mut total = 0;
        for cluster in &clusters {
            assert!(!cluster.member_ids.is_empty());
            for id in &cluster.member_ids {
                assert!(seen.insert(id.clone()), "duplicate member {}", id);
                total += 1;
            }
        }
        assert_eq!(total, input.len());
    }

    #[test]
    fn test_similar_items_grouped() {
        let input = items(&[("a", &[1.0, 0.0]), ("b", &[0.99, 0.01]), ("c", &[0.0, 1.0])]);
        let clusters = cluster_vectors(&input, &config(0.8, 8));
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].member_ids, vec!["a", "b"]);
        assert_eq!(clusters[1].member_ids, vec!["c"]);
    }

    #[test]
    fn test_high_threshold_yields_singletons() {
        let input = items(&[("a", &[1.0, 0.0]), ("b", &[0.7, 0.7]), ("c", &[0.0, 1.0])]);
        let clusters = cluster_vectors(&input, &config(0.999, 8));
        assert_eq!(clusters.len(), 3);
        for cluster in &clusters {
            assert_eq!(cluster.member_ids.len(), 1);
        }
    }

    #[test]
    fn test_max_cluster_size_respected() {
        let input = items(&[
            ("a", &[1.0, 0.0]),
            ("b", &[1.0, 0.0]),
            ("c", &[1.0, 0.0]),
            ("d", &[1.0, 0.0]),
        ]);
        let clusters = cluster_vectors(&input, &config(0.5, 2));
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert!(cluster.member_ids.len() <= 2);
        }
    }

    #[test]
    fn test_tie_break_prefers_smaller_cluster() {
        // c0 = {a} on the x axis, c1 = {b, c} on the y axis. The diagonal
        // item is equidistant from both centroids and must join the
        // smaller cluster.
        let input = items(&[
            ("a", &[1.0, 0.0]),
            ("b", &[0.0, 1.0]),
            ("c", &[0.0, 1.0]),
            ("d", &[0.7071, 0.7071]),
        ]);
        let out = cluster_vectors(&input, &config(0.5, 8));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].member_ids, vec!["a", "d"]);
        assert_eq!(out[1].member_ids, vec!["b", "c"]);
    }

    #[test]
    fn test_centroid_is_running_mean() {
        let input = items(&[("a", &[1.0, 0.0]), ("b", &[0.0, 1.0])]);
        let clusters = cluster_vectors(&input, &config(-1.0, 8));
        assert_eq!(clusters.len(), 1);
        let centroid = &clusters[0].centroid;
        assert!((centroid[0] - 0.5).abs() < 1e-6);
        assert!((centroid[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_input() {
        let clusters = cluster_vectors(&[], &config(0.6, 8));
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_force_merge_combines_all() {
        let drafts = vec![
            ClusterDraft {
                member_ids: vec!["a".into()],
                centroid: vec![1.0, 0.0],
            },
            ClusterDraft {
                member_ids: vec!["b".into(), "c".into()],
                centroid: vec![0.0, 1.0],
            },
        ];
        let merged = force_merge(drafts).unwrap();
        assert_eq!(merged.member_ids, vec!["a", "b", "c"]);
        // Weighted mean: (1*[1,0] + 2*[0,1]) / 3
        assert!((merged.centroid[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!((merged.centroid[1] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_force_merge_empty() {
        assert!(force_merge(Vec::new()).is_none());
    }
}
