use std::sync::{Arc, Once};

use anyhow::Result;
use tempfile::NamedTempFile;

use tarimdb::BufferPoolManager;

static LOGGER: Once = Once::new();

/// Route the crate's `log` output into the test harness. Repeated calls are
/// no-ops, so every test can ask for it.
#[allow(dead_code)]
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Buffer pool over a fresh temporary database file. The returned tempfile
/// keeps the database alive and must outlive the pool.
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    init_logging();
    let file = NamedTempFile::new()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, file.path())?);
    Ok((buffer_pool, file))
}
