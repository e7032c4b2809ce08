pub mod channel;
pub mod logic;
pub mod repository;

pub use channel::{AuditChannelLike, ChannelRecord, HttpChannel, RecordingChannel, StoreChannel};
pub use logic::event::{ActorType, AuditAction, AuditEvent};
pub use logic::publisher::AuditPublisher;
