// src/config.rs
//! Engine configuration: TOML file plus env overrides.
//!
//! Resolution order:
//! 1) `$SPAM_ENGINE_CONFIG_PATH` (must exist when set)
//! 2) `config/engine.toml`
//! 3) built-in defaults
//!
//! Then `SPAM_PATTERN_THRESHOLD`, `SPAM_LEARNING_THRESHOLD`, `SPAM_TIME_BUDGET_MS`,
//! `SPAM_DATABASE_PATH` and `SPAM_BACKLOG_INTERVAL_SECS` override the file, and
//! everything is clamped into sane ranges.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::decision::Thresholds;
use crate::learning::LearningParams;
use crate::resilience::ResilienceConfig;

pub const DEFAULT_ENGINE_CONFIG_PATH: &str = "config/engine.toml";
pub const ENV_ENGINE_CONFIG_PATH: &str = "SPAM_ENGINE_CONFIG_PATH";
pub const ENV_PATTERN_THRESHOLD: &str = "SPAM_PATTERN_THRESHOLD";
pub const ENV_LEARNING_THRESHOLD: &str = "SPAM_LEARNING_THRESHOLD";
pub const ENV_TIME_BUDGET_MS: &str = "SPAM_TIME_BUDGET_MS";
pub const ENV_DATABASE_PATH: &str = "SPAM_DATABASE_PATH";
pub const ENV_BACKLOG_INTERVAL_SECS: &str = "SPAM_BACKLOG_INTERVAL_SECS";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Wall-clock budget for one `process_batch` call.
    pub time_budget_ms: u64,
    /// No new chunk fetch starts once less than this is left of the budget.
    pub deadline_margin_ms: u64,
    pub fetch_chunk: usize,
    pub update_chunk: usize,
    pub max_take: usize,
    pub preview_limit: usize,
    /// Longer texts are not scored and count as errored.
    pub max_text_chars: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: 20_000,
            deadline_margin_ms: 3_000,
            fetch_chunk: 100,
            update_chunk: 200,
            max_take: 1_000,
            preview_limit: 100,
            max_text_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 0 disables the background drain.
    pub interval_secs: u64,
    pub take: usize,
    pub max_rounds: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            take: 200,
            max_rounds: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: String,
    pub thresholds: Thresholds,
    pub batch: BatchConfig,
    pub learning: LearningParams,
    pub store: ResilienceConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            thresholds: Thresholds::default(),
            batch: BatchConfig::default(),
            learning: LearningParams::default(),
            store: ResilienceConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load using env var + fallbacks, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(ENV_ENGINE_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    return Err(anyhow!(
                        "{ENV_ENGINE_CONFIG_PATH} points to non-existent path {}",
                        pb.display()
                    ));
                }
                Self::from_path(&pb)?
            }
            Err(_) => {
                let default = PathBuf::from(DEFAULT_ENGINE_CONFIG_PATH);
                if default.exists() {
                    Self::from_path(&default)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env_overrides();
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading engine config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing engine config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: EngineConfig = toml::from_str(s)?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env::<u32>(ENV_PATTERN_THRESHOLD) {
            self.thresholds.pattern = v;
        }
        if let Some(v) = parse_env::<f32>(ENV_LEARNING_THRESHOLD).filter(|v| v.is_finite()) {
            self.thresholds.learning = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_TIME_BUDGET_MS) {
            self.batch.time_budget_ms = v;
        }
        if let Ok(p) = std::env::var(ENV_DATABASE_PATH) {
            if !p.trim().is_empty() {
                self.database_path = p.trim().to_string();
            }
        }
        if let Some(v) = parse_env::<u64>(ENV_BACKLOG_INTERVAL_SECS) {
            self.scheduler.interval_secs = v;
        }
    }

    /// Clamp every knob into a usable range.
    pub fn sanitize(&mut self) {
        let t = &mut self.thresholds;
        t.pattern = t.pattern.min(100);
        t.learning = if t.learning.is_finite() {
            t.learning.clamp(0.0, 100.0)
        } else {
            Thresholds::default().learning
        };

        let b = &mut self.batch;
        b.time_budget_ms = b.time_budget_ms.max(100);
        if b.deadline_margin_ms >= b.time_budget_ms {
            b.deadline_margin_ms = b.time_budget_ms / 5;
        }
        b.fetch_chunk = b.fetch_chunk.max(1);
        b.update_chunk = b.update_chunk.max(1);
        b.max_take = b.max_take.max(1);
        b.preview_limit = b.preview_limit.clamp(1, b.max_take);
        b.max_text_chars = b.max_text_chars.max(1);

        let l = &mut self.learning;
        let d = LearningParams::default();
        if !l.near_duplicate_similarity.is_finite() {
            l.near_duplicate_similarity = d.near_duplicate_similarity;
        }
        l.near_duplicate_similarity = l.near_duplicate_similarity.clamp(0.5, 1.0);
        if !l.prior.is_finite() || l.prior < 0.0 {
            l.prior = d.prior;
        }
        if !l.max_history_weight.is_finite() {
            l.max_history_weight = d.max_history_weight;
        }
        l.max_history_weight = l.max_history_weight.clamp(0.0, 1.0);

        self.store.retry_attempts = self.store.retry_attempts.clamp(1, 10);
        self.store.breaker_failures = self.store.breaker_failures.max(1);

        self.scheduler.take = self.scheduler.take.clamp(1, self.batch.max_take);
        self.scheduler.max_rounds = self.scheduler.max_rounds.max(1);

        if self.database_path.trim().is_empty() {
            self.database_path = ":memory:".to_string();
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}
