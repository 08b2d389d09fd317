//! Shared helpers for integration tests.

use std::path::PathBuf;
use std::time::{Duration, Instant};

pub fn temp_dir(test_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("spool_test_{}", test_name))
}

pub fn setup_temp_dir(test_name: &str) -> PathBuf {
    let dir = temp_dir(test_name);
    let _ = std::fs::remove_dir_all(&dir);
    let _ = std::fs::create_dir_all(&dir);
    dir
}

pub fn cleanup_temp_dir(test_name: &str) {
    let _ = std::fs::remove_dir_all(temp_dir(test_name));
}

/// Write a file whose byte at offset `i` is `i & 0xFF`.
pub fn patterned_file(dir: &std::path::Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let bytes: Vec<u8> = (0..len).map(|i| (i & 0xFF) as u8).collect();
    std::fs::write(&path, bytes).expect("failed to write test file");
    path
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
