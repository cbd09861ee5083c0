use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// A fresh, empty directory under the system temp dir.
pub fn scratch_dir() -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let dir = std::env::temp_dir().join(format!("swarmshare-{}", suffix));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_shared(name: &str, contents: &[u8]) -> PathBuf {
    let path = scratch_dir().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
