//! Head+tail content hashing.
//!
//! Large media files are not worth reading end to end just to decide
//! identity: the digest covers the first 256 KiB and, past that size, the
//! final 256 KiB. Two files of equal size agreeing on both windows are the
//! same file as far as reconciliation is concerned — a deliberate
//! speed/accuracy trade-off for trees where both sides belong to the
//! operator.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::{io_err, ArchiveError};

/// Window size for hashing, and chunk size for streaming copies.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Hash `path` (whose stat size is `size`) into a URL-safe unpadded base64
/// digest string.
pub fn hash_file(path: &Path, size: u64) -> Result<String, ArchiveError> {
    let mut file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    let head = read_window(&mut file, &mut buf).map_err(|e| io_err(path, e))?;
    hasher.update(&buf[..head]);

    if size > CHUNK_SIZE as u64 {
        let offset = size.saturating_sub(CHUNK_SIZE as u64).max(CHUNK_SIZE as u64);
        file.seek(SeekFrom::Start(offset)).map_err(|e| io_err(path, e))?;
        let tail = read_window(&mut file, &mut buf).map_err(|e| io_err(path, e))?;
        hasher.update(&buf[..tail]);
    }

    Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// Fill `buf` from the current position, stopping at EOF. Returns the byte
/// count actually read.
fn read_window(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
