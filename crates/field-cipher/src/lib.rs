pub mod logic;

pub use logic::field::{EncryptedField, FieldCipher, FieldItem};
pub use logic::key_service::{KeyServiceLike, LocalKeyService, NoopKeyService, TransitClient};
