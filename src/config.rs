use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the segmented store
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Maximum byte size of a segment before the writer rotates (default: 16MB)
    pub max_segment_size: u64,

    /// Segment count at which a rotation triggers a merge of the older
    /// segments (default: 3)
    pub min_compaction_segments: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            max_segment_size: 16 * 1024 * 1024, // 16MB
            min_compaction_segments: 3,
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the rotation threshold
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the segment count that triggers compaction
    pub fn min_compaction_segments(mut self, count: usize) -> Self {
        self.min_compaction_segments = count;
        self
    }
}

/// Configuration for the backend balancer
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Backend addresses, in `host:port` form
    pub backends: Vec<String>,

    /// How often to probe each backend (default: 10s)
    pub probe_interval: Duration,

    /// Per-probe request timeout (default: 3s)
    pub probe_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl BalancerConfig {
    /// Create a new config with the given backend addresses
    pub fn new(backends: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the probe interval
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}
