use hmac::{Hmac, Mac};
use sha2::Sha256;
use shared::error::CommonError;

type HmacSha256 = Hmac<Sha256>;

/// Keyed HMAC-SHA256 of a field value, hex encoded. Deterministic per
/// secret, so equality lookup on an indexed column works without
/// decryption. The secret must never rotate with the encryption key or
/// existing indexed hashes become unreachable.
pub fn hash_for_search(secret: &[u8], value: &str) -> Result<String, CommonError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid search secret: {e}")))?;
    mac.update(value.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::hash_for_search;

    #[test]
    fn test_different_secrets_produce_different_hashes() {
        let first = hash_for_search(b"secret-a", "user@example.com").unwrap();
        let second = hash_for_search(b"secret-b", "user@example.com").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_hash_is_hex_sha256_sized() {
        let hash = hash_for_search(b"secret", "value").unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
