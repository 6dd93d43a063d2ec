use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CuError, CuResult};

/// Gzip a memory snapshot for caching or checkpoint transport.
pub fn gzip(bytes: &[u8]) -> CuResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| CuError::Fatal(format!("gzip memory: {e}")))
}

pub fn gunzip(bytes: &[u8]) -> CuResult<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| CuError::Fatal(format!("gunzip memory: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_shrinks_repetitive_memory() {
        let memory = vec![7u8; 64 * 1024];
        let packed = gzip(&memory).unwrap();
        assert!(packed.len() < memory.len());
        assert_eq!(gunzip(&packed).unwrap(), memory);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(gunzip(b"not a gzip stream").is_err());
    }
}
