// Deterministic field-level encryption with an integrity tag.
//
// Stored values are `<ciphertext>:<hex hmac>`. The tag is verified before
// the key service is ever contacted, so a tampered value is rejected
// locally. Values without the tag suffix predate tagging and decrypt
// without the check.

use std::sync::Arc;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared::error::CommonError;

use crate::logic::key_service::{BatchCiphertextItem, BatchPlaintextItem, KeyServiceLike};
use crate::logic::search::hash_for_search;

type HmacSha256 = Hmac<Sha256>;

/// Length of the hex-encoded HMAC-SHA256 integrity tag.
const INTEGRITY_TAG_HEX_LEN: usize = 64;

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct EncryptedField(pub String);

impl EncryptedField {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedField(************)")
    }
}

/// One batch entry: a plaintext or stored value paired with its context.
#[derive(Debug, Clone)]
pub struct FieldItem {
    pub value: String,
    pub context: String,
}

impl FieldItem {
    pub fn new(value: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            context: context.into(),
        }
    }
}

#[derive(Clone)]
pub struct FieldCipher {
    key_service: Arc<dyn KeyServiceLike>,
    integrity_key: Vec<u8>,
    search_secret: Vec<u8>,
}

impl FieldCipher {
    /// Construct the cipher once at startup. The integrity key is derived
    /// from the service key identifier so rotating the service key rotates
    /// the tag secret with it; the search secret is independent because
    /// indexed hashes must stay stable across key rotations.
    pub fn new(
        key_service: Arc<dyn KeyServiceLike>,
        search_secret: impl Into<Vec<u8>>,
    ) -> Result<Self, CommonError> {
        let mut mac = HmacSha256::new_from_slice(b"field-cipher.integrity.v1")
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid derivation tag: {e}")))?;
        mac.update(key_service.key_id().as_bytes());
        let integrity_key = mac.finalize().into_bytes().to_vec();

        Ok(Self {
            key_service,
            integrity_key,
            search_secret: search_secret.into(),
        })
    }

    fn compute_tag(&self, ciphertext: &str) -> Result<String, CommonError> {
        let mut mac = HmacSha256::new_from_slice(&self.integrity_key)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid integrity key: {e}")))?;
        mac.update(ciphertext.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify_tag(&self, ciphertext: &str, tag_hex: &str) -> Result<(), CommonError> {
        let tag = hex::decode(tag_hex).map_err(|_e| CommonError::Integrity {
            msg: "integrity tag is not valid hex".to_string(),
            source: None,
        })?;

        let mut mac = HmacSha256::new_from_slice(&self.integrity_key)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid integrity key: {e}")))?;
        mac.update(ciphertext.as_bytes());
        mac.verify_slice(&tag).map_err(|_e| CommonError::Integrity {
            msg: "integrity tag mismatch".to_string(),
            source: None,
        })
    }

    /// Split a stored value into ciphertext and tag. Values without a
    /// `:<64 hex chars>` suffix are legacy and carry no tag.
    fn split_tagged(value: &str) -> (&str, Option<&str>) {
        if let Some((body, tag)) = value.rsplit_once(':')
            && tag.len() == INTEGRITY_TAG_HEX_LEN
            && tag.bytes().all(|b| b.is_ascii_hexdigit())
        {
            (body, Some(tag))
        } else {
            (value, None)
        }
    }

    fn context_b64(context: &str) -> Option<String> {
        if context.is_empty() {
            None
        } else {
            Some(base64::engine::general_purpose::STANDARD.encode(context.as_bytes()))
        }
    }

    fn decode_plaintext(plaintext_b64: &str) -> Result<String, CommonError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(plaintext_b64)
            .map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!("key service returned invalid base64: {e}"))
            })?;
        String::from_utf8(bytes).map_err(|e| {
            CommonError::Unknown(anyhow::anyhow!("decrypted value is not valid utf-8: {e}"))
        })
    }

    /// Encrypt a single field value under the given context. The empty
    /// string passes through unchanged without contacting the key service.
    pub async fn encrypt_field(
        &self,
        plaintext: &str,
        context: &str,
    ) -> Result<EncryptedField, CommonError> {
        if plaintext.is_empty() {
            return Ok(EncryptedField(String::new()));
        }

        let plaintext_b64 = base64::engine::general_purpose::STANDARD.encode(plaintext.as_bytes());
        let context_b64 = Self::context_b64(context);

        let ciphertext = self
            .key_service
            .encrypt(&plaintext_b64, context_b64.as_deref())
            .await?;

        let tag = self.compute_tag(&ciphertext)?;
        Ok(EncryptedField(format!("{ciphertext}:{tag}")))
    }

    /// Decrypt a stored field value. The integrity tag, when present, is
    /// verified before any key service call; a mismatch is an integrity
    /// error, never a transport one.
    pub async fn decrypt_field(&self, value: &str, context: &str) -> Result<String, CommonError> {
        if value.is_empty() {
            return Ok(String::new());
        }

        let (ciphertext, tag) = Self::split_tagged(value);
        if let Some(tag) = tag {
            self.verify_tag(ciphertext, tag)?;
        }

        let context_b64 = Self::context_b64(context);
        let plaintext_b64 = self
            .key_service
            .decrypt(ciphertext, context_b64.as_deref())
            .await?;

        Self::decode_plaintext(&plaintext_b64)
    }

    /// Encrypt a batch of field values. The first failing item aborts the
    /// whole call with its index attached.
    pub async fn encrypt_fields(
        &self,
        items: &[FieldItem],
    ) -> Result<Vec<EncryptedField>, CommonError> {
        // Empty values pass through without occupying a batch slot
        let mut batch = Vec::with_capacity(items.len());
        let mut original_indices = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            if item.value.is_empty() {
                continue;
            }
            batch.push(BatchPlaintextItem {
                plaintext: base64::engine::general_purpose::STANDARD
                    .encode(item.value.as_bytes()),
                context: Self::context_b64(&item.context),
            });
            original_indices.push(index);
        }

        let mut encrypted = vec![EncryptedField(String::new()); items.len()];
        if batch.is_empty() {
            return Ok(encrypted);
        }

        let results = self.key_service.encrypt_batch(&batch).await?;
        if results.len() != batch.len() {
            return Err(CommonError::Unknown(anyhow::anyhow!(
                "key service returned {} results for {} inputs",
                results.len(),
                batch.len()
            )));
        }

        for (result, index) in results.into_iter().zip(original_indices) {
            let ciphertext = result.map_err(|e| e.at_batch_index(index))?;
            let tag = self.compute_tag(&ciphertext)?;
            encrypted[index] = EncryptedField(format!("{ciphertext}:{tag}"));
        }

        Ok(encrypted)
    }

    /// Decrypt a batch of stored values. Integrity tags are verified for
    /// every item before the key service is contacted; the first bad item
    /// fails the call with its index attached.
    pub async fn decrypt_fields(&self, items: &[FieldItem]) -> Result<Vec<String>, CommonError> {
        let mut batch = Vec::with_capacity(items.len());
        let mut original_indices = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            if item.value.is_empty() {
                continue;
            }

            let (ciphertext, tag) = Self::split_tagged(&item.value);
            if let Some(tag) = tag {
                self.verify_tag(ciphertext, tag)
                    .map_err(|e| e.at_batch_index(index))?;
            }

            batch.push(BatchCiphertextItem {
                ciphertext: ciphertext.to_string(),
                context: Self::context_b64(&item.context),
            });
            original_indices.push(index);
        }

        let mut decrypted = vec![String::new(); items.len()];
        if batch.is_empty() {
            return Ok(decrypted);
        }

        let results = self.key_service.decrypt_batch(&batch).await?;
        if results.len() != batch.len() {
            return Err(CommonError::Unknown(anyhow::anyhow!(
                "key service returned {} results for {} inputs",
                results.len(),
                batch.len()
            )));
        }

        for (result, index) in results.into_iter().zip(original_indices) {
            let plaintext_b64 = result.map_err(|e| e.at_batch_index(index))?;
            decrypted[index] = Self::decode_plaintext(&plaintext_b64)?;
        }

        Ok(decrypted)
    }

    /// Keyed hash for legacy indexed columns that need equality lookup
    /// without decryption.
    pub fn hash_for_search(&self, value: &str) -> Result<String, CommonError> {
        hash_for_search(&self.search_secret, value)
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::sync::Arc;

    use super::{FieldCipher, FieldItem};
    use crate::logic::key_service::LocalKeyService;
    use shared::error::CommonError;

    fn test_cipher() -> (tempfile::TempDir, FieldCipher) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let key_service =
            LocalKeyService::get_or_create(&temp_dir.path().join("field.key"), "test-key")
                .expect("Failed to create local key service");
        let cipher = FieldCipher::new(Arc::new(key_service), b"search-secret".to_vec())
            .expect("Failed to construct cipher");
        (temp_dir, cipher)
    }

    #[tokio::test]
    async fn test_encrypt_is_deterministic_per_context() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let first = cipher
            .encrypt_field("user@example.com", "tenant-1:email")
            .await
            .unwrap();
        let second = cipher
            .encrypt_field("user@example.com", "tenant-1:email")
            .await
            .unwrap();

        assert_eq!(first, second, "same plaintext and context must converge");

        let other_context = cipher
            .encrypt_field("user@example.com", "tenant-2:email")
            .await
            .unwrap();
        assert_ne!(first, other_context, "context must change the ciphertext");
    }

    #[tokio::test]
    async fn test_roundtrip() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let encrypted = cipher
            .encrypt_field("sensitive value", "tenant-1:name")
            .await
            .unwrap();
        let decrypted = cipher
            .decrypt_field(encrypted.as_str(), "tenant-1:name")
            .await
            .unwrap();

        assert_eq!(decrypted, "sensitive value");
    }

    #[tokio::test]
    async fn test_context_mismatch_fails_decryption() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let encrypted = cipher
            .encrypt_field("user@example.com", "tenant-1:email")
            .await
            .unwrap();

        let result = cipher
            .decrypt_field(encrypted.as_str(), "tenant-2:email")
            .await;

        assert!(
            matches!(result, Err(CommonError::Transport { .. })),
            "wrong context must fail decryption, got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_tampered_value_is_integrity_error() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let encrypted = cipher
            .encrypt_field("user@example.com", "tenant-1:email")
            .await
            .unwrap();

        // Flip one character of the ciphertext body, keep the tag
        let mut chars: Vec<char> = encrypted.0.chars().collect();
        let pos = "local:v1:".len() + 1;
        chars[pos] = if chars[pos] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        let result = cipher.decrypt_field(&tampered, "tenant-1:email").await;
        assert!(
            matches!(result, Err(CommonError::Integrity { .. })),
            "tampering must be an integrity error, got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_legacy_untagged_value_decrypts() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let encrypted = cipher
            .encrypt_field("legacy value", "tenant-1:email")
            .await
            .unwrap();

        // Strip the tag to simulate a value written before tagging
        let (body, _tag) = encrypted.0.rsplit_once(':').unwrap();
        let decrypted = cipher.decrypt_field(body, "tenant-1:email").await.unwrap();

        assert_eq!(decrypted, "legacy value");
    }

    #[tokio::test]
    async fn test_empty_string_passthrough() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let encrypted = cipher.encrypt_field("", "tenant-1:email").await.unwrap();
        assert_eq!(encrypted.as_str(), "");

        let decrypted = cipher.decrypt_field("", "tenant-1:email").await.unwrap();
        assert_eq!(decrypted, "");
    }

    #[tokio::test]
    async fn test_batch_roundtrip_with_empty_item() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let items = vec![
            FieldItem::new("first@example.com", "tenant-1:email"),
            FieldItem::new("", "tenant-1:email"),
            FieldItem::new("Jane Doe", "tenant-1:name"),
        ];

        let encrypted = cipher.encrypt_fields(&items).await.unwrap();
        assert_eq!(encrypted.len(), 3);
        assert_eq!(encrypted[1].as_str(), "");

        let stored: Vec<FieldItem> = encrypted
            .iter()
            .zip(items.iter())
            .map(|(value, item)| FieldItem::new(value.as_str(), item.context.clone()))
            .collect();

        let decrypted = cipher.decrypt_fields(&stored).await.unwrap();
        assert_eq!(
            decrypted,
            vec![
                "first@example.com".to_string(),
                "".to_string(),
                "Jane Doe".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_error_carries_index() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let good = cipher
            .encrypt_field("ok@example.com", "tenant-1:email")
            .await
            .unwrap();

        // Corrupt the second item's tag
        let (body, _tag) = good.0.rsplit_once(':').unwrap();
        let bad = format!("{body}:{}", "0".repeat(64));

        let items = vec![
            FieldItem::new(good.as_str(), "tenant-1:email"),
            FieldItem::new(bad, "tenant-1:email"),
        ];

        let result = cipher.decrypt_fields(&items).await;
        match result {
            Err(CommonError::PartialBatch { index, source }) => {
                assert_eq!(index, 1);
                assert!(matches!(*source, CommonError::Integrity { .. }));
            }
            other => panic!("expected PartialBatch at index 1, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hash_for_search_is_stable() {
        shared::setup_test!();
        let (_dir, cipher) = test_cipher();

        let first = cipher.hash_for_search("user@example.com").unwrap();
        let second = cipher.hash_for_search("user@example.com").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        let other = cipher.hash_for_search("other@example.com").unwrap();
        assert_ne!(first, other);
    }
}
