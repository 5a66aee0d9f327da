//! SHA-256 fingerprints, logged at startup so operators can tell which
//! configuration is live without printing its contents.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("unable to read {0}: {1}")]
    Io(String, std::io::Error),
}

/// Returns the hexadecimal representation of a SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex_digest(Sha256::digest(data).as_slice())
}

/// Streams a file through SHA-256.
pub fn sha256_file(path: &Path) -> Result<String, IntegrityError> {
    let io_err = |err| IntegrityError::Io(path.display().to_string(), err);
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = reader.read(&mut buffer).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_digest(hasher.finalize().as_slice()))
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
