mod sqlite;

pub use sqlite::Repository;

use async_trait::async_trait;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::logic::policy::RetentionPolicy;

/// A data subject row. PII columns hold ciphertext produced by the field
/// cipher, never plaintext.
#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub tenant_id: String,
    pub email_ciphertext: String,
    pub email_hash: Option<String>,
    pub display_name_ciphertext: Option<String>,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
    pub deleted_at: Option<WrappedChronoDateTime>,
}

#[derive(Debug)]
pub struct CreateSubject {
    pub id: String,
    pub tenant_id: String,
    pub email_ciphertext: String,
    pub email_hash: Option<String>,
    pub display_name_ciphertext: Option<String>,
    pub created_at: WrappedChronoDateTime,
    pub updated_at: WrappedChronoDateTime,
}

#[derive(Debug)]
pub struct CreateSession {
    pub id: String,
    pub subject_id: String,
    pub created_at: WrappedChronoDateTime,
    pub expires_at: WrappedChronoDateTime,
}

#[derive(Debug)]
pub struct CreateInvitation {
    pub id: String,
    pub tenant_id: String,
    pub email_ciphertext: String,
    pub invited_by_subject_id: Option<String>,
    pub created_at: WrappedChronoDateTime,
}

/// Row counts affected by one hard-delete transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardDeleteOutcome {
    pub sessions_deleted: u64,
    pub invitations_deleted: u64,
    pub audit_rows_anonymized: u64,
}

#[async_trait]
pub trait RetentionRepositoryLike {
    async fn create_subject(&self, params: &CreateSubject) -> Result<(), CommonError>;

    async fn get_subject_by_id(&self, id: &str) -> Result<Option<SubjectRow>, CommonError>;

    /// Equality lookup on the deterministic email ciphertext.
    async fn find_subject_by_email_ciphertext(
        &self,
        tenant_id: &str,
        email_ciphertext: &str,
    ) -> Result<Option<SubjectRow>, CommonError>;

    /// Returns the number of rows changed; 0 means the subject was missing.
    async fn mark_subject_deleted(
        &self,
        id: &str,
        deleted_at: WrappedChronoDateTime,
    ) -> Result<u64, CommonError>;

    async fn create_session(&self, params: &CreateSession) -> Result<(), CommonError>;

    async fn create_invitation(&self, params: &CreateInvitation) -> Result<(), CommonError>;

    async fn count_sessions_for_subject(&self, subject_id: &str) -> Result<i64, CommonError>;

    async fn count_pending_invitations_for_email(
        &self,
        tenant_id: &str,
        email_ciphertext: &str,
    ) -> Result<i64, CommonError>;

    /// Soft-deleted subjects inside the bounded notification window that
    /// have no notification marker yet, oldest first.
    async fn list_notify_eligible(
        &self,
        deleted_on_or_before: WrappedChronoDateTime,
        deleted_after: WrappedChronoDateTime,
        limit: i64,
    ) -> Result<Vec<SubjectRow>, CommonError>;

    /// One-shot marker insert; returns false when the subject was already
    /// marked.
    async fn create_notification_marker(
        &self,
        subject_id: &str,
        notified_at: WrappedChronoDateTime,
        scheduled_hard_delete_at: WrappedChronoDateTime,
    ) -> Result<bool, CommonError>;

    /// Soft-deleted subjects past the retention cutoff, oldest first.
    async fn list_hard_delete_eligible(
        &self,
        deleted_on_or_before: WrappedChronoDateTime,
        limit: i64,
    ) -> Result<Vec<SubjectRow>, CommonError>;

    /// One transaction: remove the subject row, its sessions and pending
    /// invitations, and anonymize audit events naming the subject as actor.
    async fn hard_delete_subject(
        &self,
        subject: &SubjectRow,
        anonymized_placeholder: &str,
    ) -> Result<HardDeleteOutcome, CommonError>;

    async fn upsert_policy(&self, policy: &RetentionPolicy) -> Result<(), CommonError>;

    async fn get_policy(
        &self,
        table_name: &str,
        record_type: &str,
    ) -> Result<Option<RetentionPolicy>, CommonError>;

    async fn list_policies(&self) -> Result<Vec<RetentionPolicy>, CommonError>;
}
