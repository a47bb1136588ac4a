use std::time::Duration;

/// Knobs the executor layer is allowed to tune.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Number of frames in the buffer pool
    pub pool_size: usize,
    /// Maximum number of entries in a leaf node before it splits
    pub leaf_max_size: usize,
    /// Maximum number of child slots in an internal node before it splits
    pub internal_max_size: usize,
    /// Period of the background deadlock-detection pass
    pub cycle_detection_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            leaf_max_size: 32,
            internal_max_size: 32,
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}
