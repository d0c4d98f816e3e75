//! SHA-256 over a finalized download.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Computes the SHA-256 of `path`, reading in `buffer_size`-byte chunks
/// (8 MiB by default, per the engine's finalization contract) so the whole
/// file is never held in memory at once.
pub async fn sha256_file(path: &Path, buffer_size: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Minimal hex encoder so this crate doesn't need to pull in the `hex`
/// crate for a single call site.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let bytes = bytes.as_ref();
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            write!(s, "{b:02x}").unwrap();
        }
        s
    }
}
