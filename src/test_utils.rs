//! Test utilities for ChatRelay
//!
//! Temporary directories and single-process configurations shared by the
//! unit tests.

use crate::config::{BusBackend, Config};
use tempfile::TempDir;

/// Create a temporary directory for testing
///
/// # Examples
///
/// ```ignore
/// let dir = temp_dir();
/// assert!(dir.path().exists());
/// ```
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Single-process configuration rooted in `dir`: in-memory bus, sled
/// stores under the directory, hub on an ephemeral port
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.bus.backend = BusBackend::Memory;
    config.bus.memory_partitions = 2;
    config.hub.bind_addr = "127.0.0.1:0".to_string();
    config.storage.buffer_path = dir.path().join("buffer");
    config.storage.durable_path = dir.path().join("durable");
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_test_config_is_valid() {
        let dir = temp_dir();
        let config = test_config(&dir);
        assert_eq!(config.bus.backend, BusBackend::Memory);
        assert!(config.validate().is_ok());
    }
}
