//! Runtime configuration (spec §6). Full TOML/CLI config *loading* is an
//! out-of-scope external concern (spec §1); this module only carries the
//! values the engine needs and their defaults, with env-var overrides —
//! the same precedence *shape* as `DaemonConfig::new` in
//! examples/clawde-io-apps/daemon/src/config/mod.rs, minus the TOML layer.

use std::time::Duration;

const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;
const DEFAULT_MAX_QUEUED_PER_PROJECT: i64 = 5;
const DEFAULT_TOKEN_BUDGET: i64 = 100_000;
const DEFAULT_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_SILENCE_TIMEOUT_MS: u64 = 90_000;
const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 1_800_000;
const DEFAULT_REPLAY_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 2_000;
const DEFAULT_SUMMARIZER_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_concurrent_tasks: usize,
    pub max_queued_per_project: i64,
    pub default_token_budget: i64,
    pub default_timeout_ms: u64,
    pub silence_timeout_ms: u64,
    pub approval_timeout_ms: u64,
    pub replay_timeout_ms: u64,
    pub summarizer_enabled: bool,
    pub tick_interval_ms: u64,
    pub summarizer_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            max_queued_per_project: DEFAULT_MAX_QUEUED_PER_PROJECT,
            default_token_budget: DEFAULT_TOKEN_BUDGET,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            silence_timeout_ms: DEFAULT_SILENCE_TIMEOUT_MS,
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            replay_timeout_ms: DEFAULT_REPLAY_TIMEOUT_MS,
            summarizer_enabled: true,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            summarizer_timeout_ms: DEFAULT_SUMMARIZER_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    /// Build from env vars, falling back to built-in defaults. No file or
    /// CLI parsing — see module docs.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_tasks: env_usize("MAX_CONCURRENT_TASKS", defaults.max_concurrent_tasks),
            max_queued_per_project: env_i64("MAX_QUEUED_PER_PROJECT", defaults.max_queued_per_project),
            default_token_budget: env_i64("DEFAULT_TOKEN_BUDGET", defaults.default_token_budget),
            default_timeout_ms: env_u64("DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            silence_timeout_ms: env_u64("SILENCE_TIMEOUT_MS", defaults.silence_timeout_ms),
            approval_timeout_ms: env_u64("APPROVAL_TIMEOUT_MS", defaults.approval_timeout_ms),
            replay_timeout_ms: env_u64("REPLAY_TIMEOUT_MS", defaults.replay_timeout_ms),
            summarizer_enabled: env_bool("SUMMARIZER_ENABLED", defaults.summarizer_enabled),
            tick_interval_ms: defaults.tick_interval_ms,
            summarizer_timeout_ms: defaults.summarizer_timeout_ms,
        }
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_millis(self.summarizer_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_millis(self.replay_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = RuntimeConfig::default();
        assert_eq!(c.max_concurrent_tasks, 3);
        assert_eq!(c.max_queued_per_project, 5);
        assert_eq!(c.default_token_budget, 100_000);
        assert_eq!(c.default_timeout_ms, 600_000);
        assert_eq!(c.silence_timeout_ms, 90_000);
        assert_eq!(c.approval_timeout_ms, 1_800_000);
        assert_eq!(c.replay_timeout_ms, 120_000);
        assert!(c.summarizer_enabled);
    }
}
