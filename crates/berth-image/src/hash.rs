//! SHA-256 content addressing and verification.

use std::io::Read;
use std::path::Path;

use berth_common::error::{BerthError, Result};
use berth_common::types::Sha256Hash;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of an in-memory buffer.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> Sha256Hash {
    digest_to_hash(Sha256::digest(bytes).as_slice())
}

/// Computes the SHA-256 hash of a file, streaming its content.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let mut file = std::fs::File::open(path).map_err(|e| BerthError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| BerthError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(digest_to_hash(hasher.finalize().as_slice()))
}

/// Validates that a file matches the expected SHA-256 hash.
///
/// # Errors
///
/// Returns `BerthError::HashMismatch` if the hashes do not match.
pub fn validate_hash(path: &Path, expected: &Sha256Hash) -> Result<()> {
    tracing::debug!(path = %path.display(), "validating SHA-256 hash");
    let actual = hash_file(path)?;
    if actual != *expected {
        return Err(BerthError::HashMismatch {
            resource: path.display().to_string(),
            expected: expected.as_hex().to_string(),
            actual: actual.as_hex().to_string(),
        });
    }
    Ok(())
}

fn digest_to_hash(digest: &[u8]) -> Sha256Hash {
    use std::fmt::Write;

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    // A SHA-256 digest always renders as 64 hex characters.
    Sha256Hash::from_hex(hex).unwrap_or_else(|_| unreachable!("sha256 digest is 32 bytes"))
}
