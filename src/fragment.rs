//! Fragment splitters.
//!
//! Turns the plain text of an act version or internal document into
//! ordered [`Fragment`]s. Act texts are split on legal-article headings
//! (`Art. N.`); anything before the statute header is dropped when one is
//! detected. Document texts fall back to paragraph-boundary splitting
//! bounded by `max_fragment_chars`.
//!
//! Each fragment receives a UUID, a contiguous `seq_index` starting at 0,
//! and a SHA-256 hash of its text. The hash is the content address for the
//! embedding cache and the identity used by change detection.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::models::Fragment;

fn article_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Art\.\s*\d+[a-z]{0,4}\s*\.").unwrap())
}

fn statute_header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)\b(USTAWA|ACT)\b.{0,40}?\b\d{4}\b").unwrap()
    })
}

/// Compute the SHA-256 content hash used throughout the pipeline.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split an act text on article headings.
///
/// Returns one fragment per `Art. N.` heading, in document order. Text
/// before the statute header (publication metadata, table of contents) is
/// skipped when such a header is found. A text with no article headings
/// becomes a single fragment.
pub fn split_act(owner_id: &str, text: &str) -> Vec<Fragment> {
    let mut body = text;
    if let Some(m) = statute_header_pattern().find(text) {
        body = &text[m.start()..];
    }

    let starts: Vec<usize> = article_pattern().find_iter(body).map(|m| m.start()).collect();

    if starts.is_empty() {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        return vec![make_fragment(owner_id, 0, trimmed)];
    }

    let mut fragments = Vec::with_capacity(starts.len());
    let mut seq: i64 = 0;
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(body.len());
        let article = body[start..end].trim();
        if article.is_empty() {
            continue;
        }
        fragments.push(make_fragment(owner_id, seq, article));
        seq += 1;
    }

    fragments
}

/// Split a document text on paragraph boundaries, respecting
/// `max_fragment_chars`. Returns fragments with contiguous indices
/// starting at 0.
pub fn split_document(owner_id: &str, text: &str, max_fragment_chars: usize) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut seq: i64 = 0;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };

        if would_be > max_fragment_chars && !current.is_empty() {
            fragments.push(make_fragment(owner_id, seq, &current));
            seq += 1;
            current.clear();
        }

        if trimmed.len() > max_fragment_chars {
            if !current.is_empty() {
                fragments.push(make_fragment(owner_id, seq, &current));
                seq += 1;
                current.clear();
            }
            // Hard split, preferring newline/space boundaries
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_fragment_chars));
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    fragments.push(make_fragment(owner_id, seq, piece));
                    seq += 1;
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }

    if !current.is_empty() {
        fragments.push(make_fragment(owner_id, seq, &current));
    }

    fragments
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn make_fragment(owner_id: &str, seq_index: i64, text: &str) -> Fragment {
    Fragment {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        seq_index,
        text: text.to_string(),
        text_hash: hash_text(text),
    }
}
