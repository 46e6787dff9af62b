use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

/// Writes `len` bytes of filler into `name` inside a fresh temporary directory.
/// The directory is removed once the returned guard is dropped.
pub fn fixture_file(name: &str, len: usize) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    let contents = (0..len).map(|idx| return (idx % 251) as u8).collect::<Vec<u8>>();
    fs::write(&path, contents).unwrap();

    return (dir, path);
}

/// Polls `check` every few milliseconds until it returns true, panicking after
/// two seconds.
pub async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("Condition was not met in time");
}

pub fn csrf_body(token: &str) -> String {
    return format!("{{\"token\":\"{token}\"}}");
}
