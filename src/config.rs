use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fragmenting: FragmentingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub summarize: SummarizeConfig,
    #[serde(default)]
    pub assessment: AssessmentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FragmentingConfig {
    #[serde(default = "default_max_fragment_chars")]
    pub max_fragment_chars: usize,
}

impl Default for FragmentingConfig {
    fn default() -> Self {
        Self {
            max_fragment_chars: default_max_fragment_chars(),
        }
    }
}

fn default_max_fragment_chars() -> usize {
    2800
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries with a reinforced formatting instruction when the response
    /// fails schema validation (on top of transport retries).
    #[serde(default = "default_malformed_retries")]
    pub malformed_retries: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            max_retries: 5,
            timeout_secs: 120,
            malformed_retries: 2,
            max_concurrent: 8,
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_min_similarity(),
            max_cluster_size: default_max_cluster_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizeConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: i64,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssessmentConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_gen_timeout_secs() -> u64 {
    120
}
fn default_malformed_retries() -> u32 {
    2
}
fn default_max_concurrent() -> usize {
    8
}
fn default_min_similarity() -> f32 {
    0.60
}
fn default_max_cluster_size() -> usize {
    8
}
fn default_max_depth() -> i64 {
    6
}
fn default_top_k() -> usize {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.fragmenting.max_fragment_chars == 0 {
        anyhow::bail!("fragmenting.max_fragment_chars must be > 0");
    }

    if !(0.0..=1.0).contains(&config.clustering.min_similarity) {
        anyhow::bail!("clustering.min_similarity must be in [0.0, 1.0]");
    }
    if config.clustering.max_cluster_size < 1 {
        anyhow::bail!("clustering.max_cluster_size must be >= 1");
    }

    if config.summarize.max_depth < 1 {
        anyhow::bail!("summarize.max_depth must be >= 1");
    }

    if config.assessment.top_k < 1 {
        anyhow::bail!("assessment.top_k must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse("[db]\npath = \"data/lex.sqlite\"\n").unwrap();
        assert_eq!(config.clustering.max_cluster_size, 8);
        assert!((config.clustering.min_similarity - 0.60).abs() < 1e-6);
        assert_eq!(config.summarize.max_depth, 6);
        assert_eq!(config.assessment.top_k, 5);
        assert_eq!(config.embedding.provider, "disabled");
        assert!(!config.generation.is_enabled());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn test_similarity_range_enforced() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[clustering]\nmin_similarity = 1.5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_similarity"));
    }

    #[test]
    fn test_unknown_generation_provider_rejected() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n[generation]\nprovider = \"gemini\"\nmodel = \"g\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }
}
