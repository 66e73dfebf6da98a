use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CuratorError, Result};

/// TOML-backed configuration loaded from disk.
/// Secrets (API keys) stay as env vars, see [`Secrets`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub thresholds: ThresholdsConfig,
    pub rounds: RoundsConfig,
    pub oracle: OracleConfig,
    pub index: IndexConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThresholdsConfig {
    /// Pairs at or above this merge without the oracle.
    pub auto: f64,
    pub high: f64,
    /// Floor below which candidate pairs are discarded.
    pub medium: f64,
    /// Minimum weight for an edge to enter the similarity graph.
    pub edge: f64,
    pub allow_cross_category: bool,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            auto: 0.98,
            high: 0.90,
            medium: 0.80,
            edge: 0.80,
            allow_cross_category: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoundsConfig {
    pub batch_size: usize,
    pub max_rounds: u32,
    pub improvement_threshold: f64,
    /// Rebuild the graph every N rounds; 0 disables rebuilds.
    pub rebuild_every: u32,
    pub oversized_cap: usize,
    pub include_oversized: bool,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_rounds: 8,
            improvement_threshold: 0.05,
            rebuild_every: 2,
            oversized_cap: 12,
            include_oversized: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleProvider {
    #[default]
    Claude,
    /// Offline oracle: every community goes to manual review, nothing is split.
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OracleConfig {
    pub provider: OracleProvider,
    pub model: String,
    pub base_url: Option<String>,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
    pub workers: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: OracleProvider::Claude,
            model: "claude-sonnet-4-5".to_string(),
            base_url: None,
            max_retries: 2,
            backoff_ms: 500,
            timeout_secs: 60,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IndexConfig {
    pub top_k: usize,
    pub max_top_k: usize,
    pub rerank: bool,
    pub embedding_model: String,
    pub rerank_model: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_top_k: 50,
            rerank: false,
            embedding_model: "voyage-3-large".to_string(),
            rerank_model: "rerank-2".to_string(),
        }
    }
}

/// Tie-break used when a merge keeps one of its source records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorPolicy {
    /// Earlier `created_at`, then lower id.
    #[default]
    Older,
    /// Longer body, then older.
    MoreComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    pub survivor: SurvivorPolicy,
    pub dry_run: bool,
    pub confirm_stale_state: bool,
    pub atomicity_pass: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            survivor: SurvivorPolicy::Older,
            dry_run: false,
            confirm_stale_state: false,
            atomicity_pass: true,
        }
    }
}

impl FileConfig {
    /// Rejects configurations that would make a run meaningless. Called
    /// before any round starts.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        for (name, value) in [
            ("thresholds.auto", t.auto),
            ("thresholds.high", t.high),
            ("thresholds.medium", t.medium),
            ("thresholds.edge", t.edge),
            ("rounds.improvement_threshold", self.rounds.improvement_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CuratorError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if t.auto <= t.high {
            return Err(CuratorError::Config(format!(
                "thresholds.auto ({}) must be greater than thresholds.high ({})",
                t.auto, t.high
            )));
        }
        if t.high < t.medium {
            return Err(CuratorError::Config(format!(
                "thresholds.high ({}) must be at least thresholds.medium ({})",
                t.high, t.medium
            )));
        }
        if t.edge < t.medium {
            return Err(CuratorError::Config(format!(
                "thresholds.edge ({}) must be at least thresholds.medium ({})",
                t.edge, t.medium
            )));
        }

        let positive = [
            ("rounds.batch_size", self.rounds.batch_size),
            ("rounds.max_rounds", self.rounds.max_rounds as usize),
            ("oracle.workers", self.oracle.workers),
            ("index.top_k", self.index.top_k),
            ("index.max_top_k", self.index.max_top_k),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CuratorError::Config(format!("{name} must be positive")));
            }
        }
        if self.rounds.oversized_cap < 2 {
            return Err(CuratorError::Config(format!(
                "rounds.oversized_cap must be at least 2, got {}",
                self.rounds.oversized_cap
            )));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(CuratorError::Config("oracle.timeout_secs must be positive".into()));
        }
        if self.oracle.provider == OracleProvider::Claude && self.oracle.model.trim().is_empty() {
            return Err(CuratorError::Config("oracle.model is required for the claude provider".into()));
        }
        Ok(())
    }

    /// Effective neighbor count for a pool of `pool_size` records.
    pub fn effective_top_k(&self, pool_size: usize) -> usize {
        self.index
            .top_k
            .min(self.index.max_top_k)
            .min(pool_size.saturating_sub(1))
    }
}

/// Load, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CuratorError::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;
    let config = parse_config(&content)
        .map_err(|e| CuratorError::Config(format!("{}: {e}", path.display())))?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(content)
        .map_err(|e| CuratorError::Config(format!("Failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

// --- Secrets ---

/// API keys loaded from the environment (and `.env` when present).
#[derive(Clone, Default)]
pub struct Secrets {
    pub anthropic_api_key: Option<String>,
    pub voyage_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("anthropic_api_key", &preview_opt(&self.anthropic_api_key))
            .field("voyage_api_key", &preview_opt(&self.voyage_api_key))
            .finish()
    }
}

impl Secrets {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let secrets = Self {
            anthropic_api_key: read("ANTHROPIC_API_KEY"),
            voyage_api_key: read("VOYAGE_API_KEY"),
        };
        secrets.log_keys();
        secrets
    }

    /// Fails when the configured providers need a key that is not set.
    pub fn require_for(&self, config: &FileConfig) -> Result<()> {
        if config.oracle.provider == OracleProvider::Claude && self.anthropic_api_key.is_none() {
            return Err(CuratorError::Config(
                "ANTHROPIC_API_KEY is required when oracle.provider = \"claude\"".into(),
            ));
        }
        if self.voyage_api_key.is_none() {
            return Err(CuratorError::Config(
                "VOYAGE_API_KEY is required for the similarity index".into(),
            ));
        }
        Ok(())
    }

    fn log_keys(&self) {
        tracing::info!("Secrets loaded:");
        tracing::info!("  ANTHROPIC_API_KEY: {}", preview_opt(&self.anthropic_api_key));
        tracing::info!("  VOYAGE_API_KEY: {}", preview_opt(&self.voyage_api_key));
    }
}

fn preview_opt(val: &Option<String>) -> String {
    match val {
        Some(v) if !v.is_empty() => {
            let head: String = v.chars().take(5).collect();
            format!("{head}...({} chars)", v.len())
        }
        _ => "<not set>".to_string(),
    }
}
