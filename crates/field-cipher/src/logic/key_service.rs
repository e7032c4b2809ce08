// Key service backends for deterministic field encryption.
// The remote backend talks to a transit-style secrets engine; the local
// backend gives dev and test environments the same convergent semantics
// without a network dependency.

use std::path::Path;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared::error::CommonError;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for ciphertext produced by the local backend, mirroring the
/// `vault:v1:` prefix the transit engine emits.
const LOCAL_CIPHERTEXT_PREFIX: &str = "local:v1:";

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlaintextItem {
    pub plaintext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCiphertextItem {
    pub ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// External key management service surface. Plaintext and context arrive
/// base64-encoded; context must match bit-for-bit between encrypt and
/// decrypt or decryption fails outright.
#[async_trait]
pub trait KeyServiceLike: Send + Sync {
    /// Identifier of the key this service encrypts under.
    fn key_id(&self) -> &str;

    async fn encrypt(
        &self,
        plaintext_b64: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError>;

    async fn decrypt(
        &self,
        ciphertext: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError>;

    /// Encrypt a batch of items, returning one result per input in order.
    async fn encrypt_batch(
        &self,
        items: &[BatchPlaintextItem],
    ) -> Result<Vec<Result<String, CommonError>>, CommonError> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(self.encrypt(&item.plaintext, item.context.as_deref()).await);
        }
        Ok(results)
    }

    /// Decrypt a batch of items, returning one result per input in order.
    async fn decrypt_batch(
        &self,
        items: &[BatchCiphertextItem],
    ) -> Result<Vec<Result<String, CommonError>>, CommonError> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            results.push(
                self.decrypt(&item.ciphertext, item.context.as_deref())
                    .await,
            );
        }
        Ok(results)
    }
}

// transit client

#[derive(Serialize)]
struct TransitEncryptRequest<'a> {
    plaintext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Serialize)]
struct TransitDecryptRequest<'a> {
    ciphertext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Serialize)]
struct TransitBatchRequest<T: Serialize> {
    batch_input: T,
}

#[derive(Deserialize)]
struct TransitEncryptData {
    ciphertext: String,
}

#[derive(Deserialize)]
struct TransitDecryptData {
    plaintext: String,
}

#[derive(Deserialize)]
struct TransitBatchResult {
    #[serde(default)]
    ciphertext: Option<String>,
    #[serde(default)]
    plaintext: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct TransitBatchData {
    batch_results: Vec<TransitBatchResult>,
}

#[derive(Deserialize)]
struct TransitResponse<T> {
    data: T,
}

/// Client for a transit-style secrets engine. The configured key must be
/// created with convergent encryption enabled so that identical
/// (plaintext, context) pairs produce identical ciphertext.
#[derive(Clone)]
pub struct TransitClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    key_name: String,
}

impl TransitClient {
    pub fn new(base_url: Url, token: String, key_name: String) -> Result<Self, CommonError> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "{}/{} {}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH,
            ))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token,
            key_name,
        })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/v1/transit/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            operation,
            self.key_name
        )
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<T, CommonError> {
        let url = self.endpoint(operation);
        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommonError::Transport {
                msg: format!("key service returned {status} for {url}: {body}"),
                source: None,
            });
        }

        let envelope: TransitResponse<T> = response.json().await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl KeyServiceLike for TransitClient {
    fn key_id(&self) -> &str {
        &self.key_name
    }

    async fn encrypt(
        &self,
        plaintext_b64: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError> {
        let data: TransitEncryptData = self
            .post(
                "encrypt",
                &TransitEncryptRequest {
                    plaintext: plaintext_b64,
                    context: context_b64,
                },
            )
            .await?;
        Ok(data.ciphertext)
    }

    async fn decrypt(
        &self,
        ciphertext: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError> {
        let data: TransitDecryptData = self
            .post(
                "decrypt",
                &TransitDecryptRequest {
                    ciphertext,
                    context: context_b64,
                },
            )
            .await?;
        Ok(data.plaintext)
    }

    async fn encrypt_batch(
        &self,
        items: &[BatchPlaintextItem],
    ) -> Result<Vec<Result<String, CommonError>>, CommonError> {
        let data: TransitBatchData = self
            .post("encrypt", &TransitBatchRequest { batch_input: items })
            .await?;

        Ok(data
            .batch_results
            .into_iter()
            .map(|result| match (result.ciphertext, result.error) {
                (Some(ciphertext), None) => Ok(ciphertext),
                (_, error) => Err(CommonError::Transport {
                    msg: error.unwrap_or_else(|| "missing ciphertext in batch result".to_string()),
                    source: None,
                }),
            })
            .collect())
    }

    async fn decrypt_batch(
        &self,
        items: &[BatchCiphertextItem],
    ) -> Result<Vec<Result<String, CommonError>>, CommonError> {
        let data: TransitBatchData = self
            .post("decrypt", &TransitBatchRequest { batch_input: items })
            .await?;

        Ok(data
            .batch_results
            .into_iter()
            .map(|result| match (result.plaintext, result.error) {
                (Some(plaintext), None) => Ok(plaintext),
                (_, error) => Err(CommonError::Transport {
                    msg: error.unwrap_or_else(|| "missing plaintext in batch result".to_string()),
                    source: None,
                }),
            })
            .collect())
    }
}

// local backend

#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
struct LocalKeyMaterial(Vec<u8>);

/// Deterministic AES-256-GCM over a 32-byte key held in a local file.
/// The nonce is derived from the key, context and plaintext, and the
/// context doubles as associated data, so a context mismatch fails
/// authentication instead of yielding wrong plaintext.
pub struct LocalKeyService {
    key_id: String,
    key: LocalKeyMaterial,
}

impl LocalKeyService {
    /// Read the key from `file_path`, generating and persisting a fresh
    /// 32-byte key if the file does not exist yet.
    pub fn get_or_create(file_path: &Path, key_id: impl Into<String>) -> Result<Self, CommonError> {
        let key_bytes = if file_path.exists() {
            let key_bytes = std::fs::read(file_path)?;
            if key_bytes.len() != 32 {
                return Err(CommonError::Unknown(anyhow::anyhow!(
                    "Invalid local key length in file {}: expected 32 bytes, got {}",
                    file_path.display(),
                    key_bytes.len()
                )));
            }
            key_bytes
        } else {
            use rand::RngCore;
            let mut key_bytes = vec![0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key_bytes);
            std::fs::write(file_path, &key_bytes)?;
            key_bytes
        };

        Ok(Self {
            key_id: key_id.into(),
            key: LocalKeyMaterial(key_bytes),
        })
    }

    fn derive_nonce(&self, context: &[u8], plaintext: &[u8]) -> Result<[u8; 12], CommonError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key.0)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid key length: {e}")))?;
        mac.update(b"field-cipher.nonce.v1");
        mac.update(&(context.len() as u64).to_be_bytes());
        mac.update(context);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();

        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest[..12]);
        Ok(nonce)
    }

    fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>, CommonError> {
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| CommonError::Validation {
                msg: format!("invalid base64 {what}"),
                source: Some(anyhow::Error::from(e)),
            })
    }
}

#[async_trait]
impl KeyServiceLike for LocalKeyService {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn encrypt(
        &self,
        plaintext_b64: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError> {
        let plaintext = Self::decode_b64(plaintext_b64, "plaintext")?;
        let context = match context_b64 {
            Some(context_b64) => Self::decode_b64(context_b64, "context")?,
            None => Vec::new(),
        };

        let nonce_bytes = self.derive_nonce(&context, &plaintext)?;
        let cipher = Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid key length: {e}")))?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: &context,
                },
            )
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("encryption failed: {e}")))?;

        // [nonce (12 bytes) | ciphertext], base64 under a versioned prefix
        let mut combined = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!(
            "{LOCAL_CIPHERTEXT_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(&combined)
        ))
    }

    async fn decrypt(
        &self,
        ciphertext: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError> {
        let encoded = ciphertext
            .strip_prefix(LOCAL_CIPHERTEXT_PREFIX)
            .ok_or_else(|| CommonError::Transport {
                msg: "key service rejected ciphertext: unrecognized format".to_string(),
                source: None,
            })?;

        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CommonError::Transport {
                msg: format!("key service rejected ciphertext: {e}"),
                source: None,
            })?;

        if combined.len() < 12 {
            return Err(CommonError::Transport {
                msg: "key service rejected ciphertext: too short".to_string(),
                source: None,
            });
        }

        let context = match context_b64 {
            Some(context_b64) => Self::decode_b64(context_b64, "context")?,
            None => Vec::new(),
        };

        let (nonce_bytes, payload) = combined.split_at(12);
        let cipher = Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("invalid key length: {e}")))?;

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: payload,
                    aad: &context,
                },
            )
            .map_err(|_e| CommonError::Transport {
                msg: "key service rejected ciphertext: authentication failed".to_string(),
                source: None,
            })?;

        Ok(base64::engine::general_purpose::STANDARD.encode(&plaintext))
    }
}

/// Passthrough backend for tests that only exercise orchestration around
/// the cipher. Context is embedded so mismatches still fail.
pub struct NoopKeyService;

#[async_trait]
impl KeyServiceLike for NoopKeyService {
    fn key_id(&self) -> &str {
        "noop"
    }

    async fn encrypt(
        &self,
        plaintext_b64: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError> {
        Ok(format!(
            "noop:{}:{plaintext_b64}",
            context_b64.unwrap_or("")
        ))
    }

    async fn decrypt(
        &self,
        ciphertext: &str,
        context_b64: Option<&str>,
    ) -> Result<String, CommonError> {
        let mut parts = ciphertext.splitn(3, ':');
        let (prefix, context, plaintext_b64) = (parts.next(), parts.next(), parts.next());

        match (prefix, context, plaintext_b64) {
            (Some("noop"), Some(context), Some(plaintext_b64))
                if context == context_b64.unwrap_or("") =>
            {
                Ok(plaintext_b64.to_string())
            }
            _ => Err(CommonError::Transport {
                msg: "key service rejected ciphertext".to_string(),
                source: None,
            }),
        }
    }
}
