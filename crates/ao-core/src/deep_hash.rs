//! Arweave deep-hash: a canonical SHA-384 digest over nested byte
//! structures. Blobs are tagged with their byte length, lists with their
//! element count, and list elements are chain-hashed in order, so two
//! structures collide only if they are identical shape and content.

use sha2::{Digest, Sha384};

pub const DEEP_HASH_BYTES: usize = 48;

/// One node of the structure being hashed.
pub enum DeepHashChunk<'a> {
    Blob(&'a [u8]),
    List(Vec<DeepHashChunk<'a>>),
}

pub fn deep_hash(chunk: &DeepHashChunk<'_>) -> [u8; DEEP_HASH_BYTES] {
    match chunk {
        DeepHashChunk::Blob(data) => {
            let mut tag = Vec::with_capacity(24);
            tag.extend_from_slice(b"blob");
            tag.extend_from_slice(data.len().to_string().as_bytes());

            let mut outer = Sha384::new();
            outer.update(sha384(&tag));
            outer.update(sha384(data));
            outer.finalize().into()
        }
        DeepHashChunk::List(items) => {
            let mut tag = Vec::with_capacity(24);
            tag.extend_from_slice(b"list");
            tag.extend_from_slice(items.len().to_string().as_bytes());

            let mut acc = sha384(&tag);
            for item in items {
                let mut pair = Sha384::new();
                pair.update(acc);
                pair.update(deep_hash(item));
                acc = pair.finalize().into();
            }
            acc
        }
    }
}

fn sha384(bytes: &[u8]) -> [u8; DEEP_HASH_BYTES] {
    Sha384::digest(bytes).into()
}
