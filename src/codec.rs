//! Key and value codecs
//!
//! A session encodes every key and value it sends to the engine and decodes
//! what comes back. `Raw` passes bytes through untouched; `Prefixed`
//! namespaces a session's keys under a fixed byte prefix.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{AtlasError, Result};

/// Pluggable encoding between caller bytes and engine bytes
pub trait Codec: Send + Sync + fmt::Debug {
    fn encode(&self, data: &[u8]) -> Result<Bytes>;

    fn decode(&self, raw: Bytes) -> Result<Bytes>;

    /// Encoded keyspace this codec can produce, as (inclusive lower,
    /// exclusive upper). Iterators clamp unset bounds to it.
    fn bounds(&self) -> (Option<Bytes>, Option<Bytes>) {
        (None, None)
    }
}

/// Identity codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Codec for Raw {
    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decode(&self, raw: Bytes) -> Result<Bytes> {
        Ok(raw)
    }
}

/// Prepends a fixed prefix on encode and strips it on decode
#[derive(Debug, Clone)]
pub struct Prefixed {
    prefix: Bytes,
}

impl Prefixed {
    pub fn new(prefix: impl AsRef<[u8]>) -> Self {
        Self {
            prefix: Bytes::copy_from_slice(prefix.as_ref()),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl Codec for Prefixed {
    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.prefix.len() + data.len());
        buf.put_slice(&self.prefix);
        buf.put_slice(data);
        Ok(buf.freeze())
    }

    fn decode(&self, raw: Bytes) -> Result<Bytes> {
        if !raw.starts_with(&self.prefix) {
            return Err(AtlasError::Encoding(format!(
                "key {:?} lacks prefix {:?}",
                raw, self.prefix
            )));
        }
        Ok(raw.slice(self.prefix.len()..))
    }

    fn bounds(&self) -> (Option<Bytes>, Option<Bytes>) {
        if self.prefix.is_empty() {
            return (None, None);
        }
        (Some(self.prefix.clone()), successor(&self.prefix))
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` if the prefix is all 0xff
fn successor(prefix: &[u8]) -> Option<Bytes> {
    let end = prefix.iter().rposition(|b| *b != 0xff)?;
    let mut next = prefix[..=end].to_vec();
    next[end] += 1;
    Some(Bytes::from(next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_identity() {
        let encoded = Raw.encode(b"hello").unwrap();
        assert_eq!(&encoded[..], b"hello");
        assert_eq!(Raw.decode(encoded.clone()).unwrap(), encoded);
        assert_eq!(Raw.bounds(), (None, None));
    }

    #[test]
    fn test_prefixed_strips_on_decode() {
        let codec = Prefixed::new("users/");
        let encoded = codec.encode(b"alice").unwrap();
        assert_eq!(&encoded[..], b"users/alice");
        assert_eq!(&codec.decode(encoded).unwrap()[..], b"alice");
    }

    #[test]
    fn test_prefixed_rejects_foreign_key() {
        let codec = Prefixed::new("users/");
        let err = codec.decode(Bytes::from_static(b"orders/1")).unwrap_err();
        assert!(matches!(err, AtlasError::Encoding(_)));
    }

    #[test]
    fn test_prefixed_bounds() {
        let (lower, upper) = Prefixed::new("ab").bounds();
        assert_eq!(lower.as_deref(), Some(&b"ab"[..]));
        assert_eq!(upper.as_deref(), Some(&b"ac"[..]));

        let (_, upper) = Prefixed::new([b'a', 0xff]).bounds();
        assert_eq!(upper.as_deref(), Some(&b"b"[..]));

        let (_, upper) = Prefixed::new([0xff, 0xff]).bounds();
        assert_eq!(upper, None);
    }
}
