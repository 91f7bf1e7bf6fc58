use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::Result;

pub const DIGEST_HEX_LEN: usize = 32;

const READ_BLOCK_BYTES: usize = 1024 * 1024;

/// Streaming content hasher producing the lowercase-hex etag the remote
/// service expects for whole files and single slices.
#[derive(Default)]
pub struct Fingerprinter {
    inner: Md5,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hashes a whole file in fixed-size read blocks; memory stays bounded
/// regardless of file size.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Fingerprinter::new();
    let mut block = vec![0u8; READ_BLOCK_BYTES];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hasher.finalize())
}

pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Fingerprinter::new();
    hasher.update(bytes);
    hasher.finalize()
}
