//! Font obfuscation: key derivation and the XOR primitive itself
//! (spec.md 4.11).
//!
//! Two schemes share one mechanical shape -- XOR a fixed-length prefix of
//! the font file with a repeating key -- and differ only in the algorithm
//! URI, the key-derivation rule, and the prefix length. Decryption and
//! re-encryption are the same operation, so `xor_obfuscate` is called once
//! at open (to clear the font) and once again at commit (to re-obfuscate
//! it for the packaged output).

use sha1::{Digest, Sha1};
use uuid::Uuid;

use container_core::error::{ContainerError, Result};

/// Published in `META-INF/encryption.xml`'s `<EncryptionMethod Algorithm="...">`.
pub const ADOBE_OBFUSCATION_URI: &str = "http://ns.adobe.com/pdf/enc#RC";
pub const IDPF_OBFUSCATION_URI: &str = "http://www.idpf.org/2008/embedding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Adobe,
    Idpf,
}

impl Algorithm {
    pub fn from_uri(uri: &str) -> Option<Algorithm> {
        match uri {
            ADOBE_OBFUSCATION_URI => Some(Algorithm::Adobe),
            IDPF_OBFUSCATION_URI => Some(Algorithm::Idpf),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Algorithm::Adobe => ADOBE_OBFUSCATION_URI,
            Algorithm::Idpf => IDPF_OBFUSCATION_URI,
        }
    }

    /// Length of the font-file prefix the algorithm scrambles.
    fn prefix_len(self) -> usize {
        match self {
            Algorithm::Adobe => 1024,
            Algorithm::Idpf => 1040,
        }
    }
}

/// IDPF key: SHA-1 of the raw bytes of the OPF unique-identifier's text,
/// taking only the portion after the last `:` (spec.md 4.11).
pub fn idpf_key(unique_identifier_text: &str) -> Vec<u8> {
    let tail = unique_identifier_text.rsplit(':').next().unwrap_or(unique_identifier_text);
    let mut hasher = Sha1::new();
    hasher.update(tail.as_bytes());
    hasher.finalize().to_vec()
}

/// Adobe key: the 16-byte binary form of a UUID found in the OPF metadata
/// (via a `scheme="uuid"` identifier or a `urn:uuid:`-prefixed one),
/// taking only the text after the last `:` (spec.md 4.11). Returns `None`
/// if the candidate text doesn't parse as a UUID.
pub fn adobe_key(identifier_text: &str) -> Option<Vec<u8>> {
    let tail = identifier_text.rsplit(':').next().unwrap_or(identifier_text);
    let uuid = Uuid::parse_str(tail).ok()?;
    Some(uuid.as_bytes().to_vec())
}

/// XORs the algorithm's fixed-length prefix of `data` in place with `key`,
/// cycling the key across that prefix. Applying this twice with the same
/// key and algorithm is the identity operation.
pub fn xor_obfuscate(data: &mut [u8], key: &[u8], algorithm: Algorithm) -> Result<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidBook(
            "font obfuscation key is empty".to_string(),
        ));
    }
    let n = algorithm.prefix_len().min(data.len());
    for (i, byte) in data.iter_mut().take(n).enumerate() {
        *byte ^= key[i % key.len()];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idpf_key_hashes_tail_after_colon() {
        let k1 = idpf_key("urn:uuid:12345");
        let k2 = idpf_key("12345");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 20);
    }

    #[test]
    fn adobe_key_parses_uuid_tail() {
        let key = adobe_key("urn:uuid:f47ac10b-58cc-4372-a567-0e02b2c3d479").unwrap();
        assert_eq!(key.len(), 16);
    }

    #[test]
    fn adobe_key_none_on_unparsable() {
        assert!(adobe_key("not-a-uuid").is_none());
    }

    #[test]
    fn xor_twice_is_identity() {
        let original: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        let key = vec![0xAB, 0xCD, 0xEF, 0x01];
        let mut data = original.clone();
        xor_obfuscate(&mut data, &key, Algorithm::Adobe).unwrap();
        assert_ne!(data, original);
        xor_obfuscate(&mut data, &key, Algorithm::Adobe).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn xor_rejects_empty_key() {
        let mut data = vec![0u8; 10];
        assert!(xor_obfuscate(&mut data, &[], Algorithm::Idpf).is_err());
    }
}
