//! Content fingerprinting for catalog records.
//!
//! Every file in the shared set is identified by the SHA-256 of its full
//! byte stream, rendered as lowercase hex. The hex form is exactly 64
//! characters, which is also the fixed request size of the transfer
//! protocol.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Length of a content hash in its hex form.
pub const HASH_HEX_LEN: usize = 64;

/// Read chunk size for streaming hashes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Hash a file's contents with streaming SHA-256.
///
/// Reads in 64 KiB chunks so large files never need to fit in memory.
/// Two computations over identical bytes always produce identical output.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash an in-memory byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check whether a string is a well-formed content hash.
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}
