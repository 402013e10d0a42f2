use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::TransferResult;

const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// Hex sha256 of a local file, read in chunks
pub async fn checksum_file(path: &Path) -> TransferResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Running sha256 over bytes as they stream past
#[derive(Default)]
pub struct ChecksumWriter {
    hasher: Sha256,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
