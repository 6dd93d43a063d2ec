//! Data item digest and signer seam.
//!
//! The dedup digest for a forwarded message is the deep-hash a data item
//! would sign over, computed with the zero-owner convention: the owner
//! field is a fixed-length run of zero bytes so the digest depends only
//! on `(data, tags, target, anchor)`. The real bundle/signing library is
//! an external collaborator; units depend on the `DataItemSigner` trait.

use async_trait::async_trait;
use base64::prelude::*;

use crate::deep_hash::{deep_hash, DeepHashChunk};
use crate::error::CoreError;
use crate::tags::Tag;

/// Arweave (RSA-4096) signature scheme id, owner and signature lengths.
const SIG_TYPE_ARWEAVE: &[u8] = b"1";
const OWNER_LENGTH: usize = 512;
const ANCHOR_MAX_LENGTH: usize = 32;
const TARGET_LENGTH: usize = 32;

/// Canonical digest of a data item under the zero-owner convention,
/// base64url-encoded. Acts as the content id for dedup.
pub fn data_item_deep_hash(
    data: &[u8],
    tags: &[Tag],
    target: Option<&str>,
    anchor: Option<&str>,
) -> Result<String, CoreError> {
    let target_raw = decode_target(target)?;
    let anchor_raw = anchor.unwrap_or("").as_bytes();
    if anchor_raw.len() > ANCHOR_MAX_LENGTH {
        return Err(CoreError::IllFormed(format!(
            "anchor exceeds {ANCHOR_MAX_LENGTH} bytes"
        )));
    }

    let owner = [0u8; OWNER_LENGTH];
    let tag_bytes = encode_tags(tags);
    let digest = deep_hash(&DeepHashChunk::List(vec![
        DeepHashChunk::Blob(b"dataitem"),
        DeepHashChunk::Blob(b"1"),
        DeepHashChunk::Blob(SIG_TYPE_ARWEAVE),
        DeepHashChunk::Blob(&owner),
        DeepHashChunk::Blob(&target_raw),
        DeepHashChunk::Blob(anchor_raw),
        DeepHashChunk::Blob(&tag_bytes),
        DeepHashChunk::Blob(data),
    ]));
    Ok(BASE64_URL_SAFE_NO_PAD.encode(digest))
}

fn decode_target(target: Option<&str>) -> Result<Vec<u8>, CoreError> {
    let target = match target {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(Vec::new()),
    };
    let raw = BASE64_URL_SAFE_NO_PAD
        .decode(target)
        .map_err(|e| CoreError::IllFormed(format!("target is not base64url: {e}")))?;
    if raw.len() != TARGET_LENGTH {
        return Err(CoreError::IllFormed(format!(
            "target decodes to {} bytes, expected {TARGET_LENGTH}",
            raw.len()
        )));
    }
    Ok(raw)
}

/// Avro block encoding of a tag array: zigzag-varint count, then
/// length-prefixed name/value pairs, then a zero terminator. An empty
/// array encodes as the empty buffer.
pub fn encode_tags(tags: &[Tag]) -> Vec<u8> {
    if tags.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    encode_long(tags.len() as i64, &mut out);
    for tag in tags {
        encode_long(tag.name.len() as i64, &mut out);
        out.extend_from_slice(tag.name.as_bytes());
        encode_long(tag.value.len() as i64, &mut out);
        out.extend_from_slice(tag.value.as_bytes());
    }
    encode_long(0, &mut out);
    out
}

fn encode_long(value: i64, out: &mut Vec<u8>) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Material for a data item before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedDataItem {
    pub data: Vec<u8>,
    pub tags: Vec<Tag>,
    pub target: Option<String>,
    pub anchor: Option<String>,
}

/// A sealed data item ready for transport: the assigned id plus the
/// serialized signed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDataItem {
    pub id: String,
    pub bytes: Vec<u8>,
}

/// Seam over the external bundle/signing library.
#[async_trait]
pub trait DataItemSigner: Send + Sync {
    /// Wallet address of the signing key.
    fn address(&self) -> &str;

    async fn sign(&self, item: UnsignedDataItem) -> Result<SignedDataItem, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64_id(byte: u8) -> String {
        BASE64_URL_SAFE_NO_PAD.encode([byte; 32])
    }

    #[test]
    fn digest_is_stable_and_content_addressed() {
        let tags = vec![Tag::new("Action", "Eval")];
        let a = data_item_deep_hash(b"payload", &tags, Some(&b64_id(7)), Some("anchor")).unwrap();
        let b = data_item_deep_hash(b"payload", &tags, Some(&b64_id(7)), Some("anchor")).unwrap();
        assert_eq!(a, b);

        let c = data_item_deep_hash(b"payload!", &tags, Some(&b64_id(7)), Some("anchor")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn digest_depends_on_tags_and_target() {
        let base = data_item_deep_hash(b"x", &[], None, None).unwrap();
        let tagged =
            data_item_deep_hash(b"x", &[Tag::new("Type", "Message")], None, None).unwrap();
        let targeted = data_item_deep_hash(b"x", &[], Some(&b64_id(1)), None).unwrap();
        assert_ne!(base, tagged);
        assert_ne!(base, targeted);
    }

    #[test]
    fn oversized_anchor_is_ill_formed() {
        let long = "a".repeat(33);
        let err = data_item_deep_hash(b"x", &[], None, Some(&long)).unwrap_err();
        assert!(matches!(err, CoreError::IllFormed(_)));
    }

    #[test]
    fn short_target_is_ill_formed() {
        let short = BASE64_URL_SAFE_NO_PAD.encode([1u8; 16]);
        let err = data_item_deep_hash(b"x", &[], Some(&short), None).unwrap_err();
        assert!(matches!(err, CoreError::IllFormed(_)));
    }

    #[test]
    fn tag_encoding_has_count_and_terminator() {
        let bytes = encode_tags(&[Tag::new("a", "b")]);
        // zigzag(1) == 2, zigzag(0) == 0
        assert_eq!(bytes.first(), Some(&2));
        assert_eq!(bytes.last(), Some(&0));
        assert!(encode_tags(&[]).is_empty());
    }
}
