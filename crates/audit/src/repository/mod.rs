mod sqlite;

pub use sqlite::Repository;

use async_trait::async_trait;
use shared::{
    error::CommonError,
    primitives::{PaginatedResponse, PaginationRequest, WrappedChronoDateTime, WrappedJsonValue},
};

use crate::logic::event::{ActorType, AuditAction, AuditEvent};

/// An audit event as persisted. Unlike the wire form, every defaulted
/// field is present.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredAuditEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub actor_email: Option<String>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub purpose: Option<String>,
    pub consent_id: Option<String>,
    pub before_value: Option<WrappedJsonValue>,
    pub after_value: Option<WrappedJsonValue>,
    pub metadata: Option<WrappedJsonValue>,
    pub service_name: String,
    pub occurred_at: WrappedChronoDateTime,
}

#[async_trait]
pub trait AuditEventRepositoryLike {
    async fn insert_event(&self, event: &AuditEvent) -> Result<(), CommonError>;

    /// Insert a batch atomically.
    async fn insert_events(&self, events: &[AuditEvent]) -> Result<(), CommonError>;

    async fn get_event_by_id(
        &self,
        event_id: &str,
    ) -> Result<Option<StoredAuditEvent>, CommonError>;

    async fn list_events_for_actor(
        &self,
        actor_id: &str,
        pagination: &PaginationRequest,
    ) -> Result<PaginatedResponse<StoredAuditEvent>, CommonError>;
}
