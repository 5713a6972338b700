use std::path::PathBuf;
use std::time::Duration;

use atlas_core::{Metric, ProjectorConfig, TreeParams};
use serde::{Deserialize, Serialize};

use super::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub leaf_capacity: usize,
    pub fanout: usize,
    /// Pending overlay operations that trigger a background reorganize.
    pub overlay_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let tree = TreeParams::default();
        Self {
            leaf_capacity: tree.leaf_capacity,
            fanout: tree.fanout,
            overlay_capacity: 4096,
        }
    }
}

impl IndexConfig {
    pub fn tree_params(&self) -> TreeParams {
        TreeParams {
            leaf_capacity: self.leaf_capacity,
            fanout: self.fanout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub metric: Metric,
    /// Lower bound on the filter-phase candidate target `M`.
    pub min_candidates: usize,
    /// `M = max(candidate_multiplier * k, min_candidates)`.
    pub candidate_multiplier: usize,
    /// First radius as a fraction of the namespace frame diagonal.
    pub initial_radius_fraction: f32,
    pub expansion_factor: f32,
    pub max_expansions: usize,
    /// Deadline for requests without their own timeout. A duration past the
    /// range of `Instant` (such as `Duration::MAX`) disables the deadline.
    pub default_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            min_candidates: 1000,
            candidate_multiplier: 10,
            initial_radius_fraction: 0.01,
            expansion_factor: 1.5,
            max_expansions: 32,
            default_timeout: Duration::from_secs(5),
        }
    }
}

impl SearchConfig {
    pub fn candidate_target(&self, k: usize) -> usize {
        self.candidate_multiplier
            .saturating_mul(k)
            .max(self.min_candidates)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub projector: ProjectorConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub query_threads: usize,
    pub background_threads: usize,
    /// History older than this may be purged. `None` keeps everything.
    pub history_retention: Option<Duration>,
    pub fault_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_data_dir(PathBuf::from("atlas-data"))
    }
}

impl EngineConfig {
    pub fn from_data_dir(data_dir: PathBuf) -> Self {
        let snapshots_dir = data_dir.join("snapshots");
        let tmp_dir = data_dir.join("tmp");
        let available = std::thread::available_parallelism()
            .map(|v| v.get())
            .unwrap_or(2);

        Self {
            data_dir,
            snapshots_dir,
            tmp_dir,
            projector: ProjectorConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            query_threads: (available / 2).clamp(1, 4),
            background_threads: 1,
            history_retention: None,
            fault_channel_capacity: 1024,
        }
    }

    /// Applies `ATLAS_*` environment overrides. Unparsable values are logged
    /// and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("ATLAS_QUERY_THREADS") {
            self.query_threads = v;
        }
        if let Some(v) = env_parse::<usize>("ATLAS_BACKGROUND_THREADS") {
            self.background_threads = v;
        }
        if let Ok(raw) = std::env::var("ATLAS_METRIC") {
            match Metric::parse(&raw) {
                Some(metric) => self.search.metric = metric,
                None => tracing::warn!("ignoring ATLAS_METRIC={raw}: expected cosine or euclidean"),
            }
        }
        if let Some(v) = env_parse::<usize>("ATLAS_MIN_CANDIDATES") {
            self.search.min_candidates = v;
        }
        if let Some(secs) = env_parse::<u64>("ATLAS_HISTORY_RETENTION_SECS") {
            self.history_retention = Some(Duration::from_secs(secs));
        }
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        self.index
            .tree_params()
            .validate()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let invalid = |msg: &str| Err(EngineError::InvalidRequest(msg.to_string()));
        if self.index.overlay_capacity == 0 {
            return invalid("index.overlay_capacity must be at least 1");
        }
        if self.query_threads == 0 || self.background_threads == 0 {
            return invalid("thread pools need at least one thread");
        }
        if self.search.min_candidates == 0 || self.search.candidate_multiplier == 0 {
            return invalid("search candidate target must be positive");
        }
        if !(self.search.initial_radius_fraction > 0.0) {
            return invalid("search.initial_radius_fraction must be positive");
        }
        if !(self.search.expansion_factor > 1.0) {
            return invalid("search.expansion_factor must exceed 1.0");
        }
        if self.search.default_timeout.is_zero() {
            return invalid("search.default_timeout must be positive");
        }
        if self.fault_channel_capacity == 0 {
            return invalid("fault_channel_capacity must be at least 1");
        }
        if !(self.projector.frame_margin >= 0.0) {
            return invalid("projector.frame_margin must be non-negative");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {name}={raw}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_candidate_target() {
        let search = SearchConfig::default();
        assert_eq!(search.candidate_target(10), 1000);
        assert_eq!(search.candidate_target(500), 5000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.search.expansion_factor = 1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.index.fanout = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.query_threads = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.search.default_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_default_timeout_is_valid() {
        let mut config = EngineConfig::default();
        config.search.default_timeout = Duration::MAX;
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("ATLAS_MIN_CANDIDATES", "64");
        std::env::set_var("ATLAS_METRIC", "euclidean");
        std::env::set_var("ATLAS_QUERY_THREADS", "not-a-number");
        let config = EngineConfig::default().with_env_overrides();
        std::env::remove_var("ATLAS_MIN_CANDIDATES");
        std::env::remove_var("ATLAS_METRIC");
        std::env::remove_var("ATLAS_QUERY_THREADS");

        assert_eq!(config.search.min_candidates, 64);
        assert_eq!(config.search.metric, Metric::Euclidean);
        assert_eq!(
            config.query_threads,
            EngineConfig::default().query_threads
        );
    }
}
