use std::sync::Arc;

use async_trait::async_trait;
use audit::{ActorType, AuditAction, AuditEvent, AuditPublisher};
use chrono::{DateTime, Duration, Utc};
use field_cipher::FieldCipher;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::{info, warn};

use crate::repository::{CreateSubject, RetentionRepositoryLike, SubjectRow};

/// An upcoming-deletion notice addressed to the subject. `email` is
/// plaintext; it exists only in memory for the duration of the send.
#[derive(Debug, Clone)]
pub struct DeletionNotice {
    pub subject_id: String,
    pub tenant_id: String,
    pub email: String,
    pub scheduled_hard_delete_at: WrappedChronoDateTime,
}

#[async_trait]
pub trait NoticeSenderLike: Send + Sync {
    async fn send(&self, notice: &DeletionNotice) -> Result<(), CommonError>;
}

/// Default sender when no mail transport is configured. Logs the schedule
/// without the address.
pub struct LogNoticeSender;

#[async_trait]
impl NoticeSenderLike for LogNoticeSender {
    async fn send(&self, notice: &DeletionNotice) -> Result<(), CommonError> {
        info!(
            subject_id = %notice.subject_id,
            scheduled_hard_delete_at = %notice.scheduled_hard_delete_at.get_inner().to_rfc3339(),
            "deletion notice"
        );
        Ok(())
    }
}

/// Fallback windows used when no active retention policy row exists for the
/// subject table.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub retention_days: i64,
    pub notice_lead_days: i64,
    pub hard_delete_batch_size: i64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            retention_days: 90,
            notice_lead_days: 30,
            hard_delete_batch_size: 100,
        }
    }
}

impl LifecycleSettings {
    fn validate(&self) -> Result<(), CommonError> {
        if self.retention_days <= 0 || self.hard_delete_batch_size <= 0 {
            return Err(CommonError::Validation {
                msg: "retention_days and hard_delete_batch_size must be positive".to_string(),
                source: None,
            });
        }
        if self.notice_lead_days < 0 || self.notice_lead_days >= self.retention_days {
            return Err(CommonError::Validation {
                msg: format!(
                    "notice_lead_days must be in [0, {}), got {}",
                    self.retention_days, self.notice_lead_days
                ),
                source: None,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub notified: u64,
    pub hard_deleted: u64,
}

/// Drives a subject through soft delete, deletion notice and hard delete.
///
/// Hard deletion is one repository transaction that also anonymizes the
/// subject's audit trail; the confirming audit event is emitted after the
/// commit and is deliberately fire-and-forget.
pub struct DeletionLifecycle<R> {
    repository: R,
    cipher: Arc<FieldCipher>,
    publisher: AuditPublisher,
    notice_sender: Arc<dyn NoticeSenderLike>,
    settings: LifecycleSettings,
}

/// Encryption context for subject email fields. Tenant-scoped rather than
/// subject-scoped so the deterministic ciphertext supports equality lookup
/// before the subject id is known.
pub fn email_context(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}|subject:email")
}

fn display_name_context(tenant_id: &str, subject_id: &str) -> String {
    format!("tenant:{tenant_id}|subject:{subject_id}|display_name")
}

impl<R: RetentionRepositoryLike> DeletionLifecycle<R> {
    pub fn new(
        repository: R,
        cipher: Arc<FieldCipher>,
        publisher: AuditPublisher,
        notice_sender: Arc<dyn NoticeSenderLike>,
        settings: LifecycleSettings,
    ) -> Result<Self, CommonError> {
        settings.validate()?;
        Ok(Self {
            repository,
            cipher,
            publisher,
            notice_sender,
            settings,
        })
    }

    /// Active windows for the subject table. An active `retention_policy`
    /// row overrides the static settings; grace days extend the retention
    /// window before hard delete.
    async fn effective_windows(&self) -> Result<(i64, i64), CommonError> {
        match self.repository.get_policy("subject", "").await? {
            Some(policy) if policy.is_active => Ok((
                policy.retention_period_days + policy.grace_period_days,
                policy.notification_days_before,
            )),
            _ => Ok((self.settings.retention_days, self.settings.notice_lead_days)),
        }
    }

    pub async fn register_subject(
        &self,
        tenant_id: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<SubjectRow, CommonError> {
        if email.is_empty() {
            return Err(CommonError::Validation {
                msg: "subject email must not be empty".to_string(),
                source: None,
            });
        }

        let subject_id = uuid::Uuid::new_v4().to_string();
        let email_ciphertext = self
            .cipher
            .encrypt_field(email, &email_context(tenant_id))
            .await?;
        let display_name_ciphertext = match display_name {
            Some(name) => Some(
                self.cipher
                    .encrypt_field(name, &display_name_context(tenant_id, &subject_id))
                    .await?
                    .0,
            ),
            None => None,
        };

        let now = WrappedChronoDateTime::now();
        let params = CreateSubject {
            id: subject_id.clone(),
            tenant_id: tenant_id.to_string(),
            email_ciphertext: email_ciphertext.0,
            email_hash: Some(self.cipher.hash_for_search(email)?),
            display_name_ciphertext,
            created_at: now,
            updated_at: now,
        };
        self.repository.create_subject(&params).await?;

        let mut event = AuditEvent::new(
            tenant_id,
            ActorType::System,
            AuditAction::Create,
            "subject",
            &subject_id,
        );
        event.actor_id = Some(subject_id.clone());
        if let Err(e) = self.publisher.publish(event).await {
            warn!(subject_id = %subject_id, error = ?e, "failed to publish create event");
        }

        self.repository
            .get_subject_by_id(&subject_id)
            .await?
            .ok_or_else(|| CommonError::Repository {
                msg: format!("subject {subject_id} missing after insert"),
                source: None,
            })
    }

    /// Equality lookup by re-encrypting the probe address under the tenant
    /// email context.
    pub async fn find_subject_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<SubjectRow>, CommonError> {
        let ciphertext = self
            .cipher
            .encrypt_field(email, &email_context(tenant_id))
            .await?;
        self.repository
            .find_subject_by_email_ciphertext(tenant_id, ciphertext.as_str())
            .await
    }

    /// Start of the deletion lifecycle. The row stays in place with
    /// `deleted_at` set; hard delete happens once the retention window
    /// elapses.
    pub async fn soft_delete_subject(&self, subject_id: &str) -> Result<(), CommonError> {
        let subject = self
            .repository
            .get_subject_by_id(subject_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: "subject not found".to_string(),
                lookup_id: subject_id.to_string(),
                source: None,
            })?;

        if subject.deleted_at.is_some() {
            return Err(CommonError::AlreadyDeleted {
                msg: "subject is already soft-deleted".to_string(),
                lookup_id: subject_id.to_string(),
            });
        }

        let (retention_days, lead_days) = self.effective_windows().await?;
        let affected = self
            .repository
            .mark_subject_deleted(subject_id, WrappedChronoDateTime::now())
            .await?;
        if affected == 0 {
            // Lost a race with another deleter
            return Err(CommonError::AlreadyDeleted {
                msg: "subject is already soft-deleted".to_string(),
                lookup_id: subject_id.to_string(),
            });
        }

        let mut event = AuditEvent::new(
            subject.tenant_id.as_str(),
            ActorType::System,
            AuditAction::Delete,
            "subject",
            subject_id,
        );
        event.actor_id = Some(subject_id.to_string());
        event.metadata = Some(serde_json::json!({
            "retention_days": retention_days,
            "notice_lead_days": lead_days,
        }));
        if let Err(e) = self.publisher.publish(event).await {
            warn!(subject_id = %subject_id, error = ?e, "failed to publish delete event");
        }

        Ok(())
    }

    /// Notify subjects whose hard delete is coming up. The window is one
    /// day wide, not open-ended, so a backlog that ages past it during a
    /// scheduler outage is not re-notified on every later pass. The marker
    /// row makes delivery at-most-once per subject on top of that: it is
    /// written before the send, so a failed send is logged and never
    /// retried automatically.
    pub async fn run_notify_pass(&self, now: DateTime<Utc>) -> Result<u64, CommonError> {
        let (retention_days, lead_days) = self.effective_windows().await?;
        if lead_days == 0 {
            return Ok(0);
        }

        let notify_after_days = retention_days - lead_days;
        let deleted_on_or_before =
            WrappedChronoDateTime::new(now - Duration::days(notify_after_days));
        let deleted_after = WrappedChronoDateTime::new(now - Duration::days(notify_after_days + 1));

        let eligible = self
            .repository
            .list_notify_eligible(
                deleted_on_or_before,
                deleted_after,
                self.settings.hard_delete_batch_size,
            )
            .await?;

        let mut notified = 0;
        for subject in eligible {
            match self.notify_subject(&subject, retention_days, now).await {
                Ok(true) => notified += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(subject_id = %subject.id, error = ?e, "deletion notice failed");
                }
            }
        }
        Ok(notified)
    }

    async fn notify_subject(
        &self,
        subject: &SubjectRow,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CommonError> {
        let deleted_at = subject.deleted_at.ok_or_else(|| CommonError::Repository {
            msg: format!("notify-eligible subject {} has no deleted_at", subject.id),
            source: None,
        })?;
        let scheduled_hard_delete_at =
            WrappedChronoDateTime::new(*deleted_at.get_inner() + Duration::days(retention_days));

        let inserted = self
            .repository
            .create_notification_marker(
                &subject.id,
                WrappedChronoDateTime::new(now),
                scheduled_hard_delete_at,
            )
            .await?;
        if !inserted {
            return Ok(false);
        }

        let email = self
            .cipher
            .decrypt_field(&subject.email_ciphertext, &email_context(&subject.tenant_id))
            .await?;
        self.notice_sender
            .send(&DeletionNotice {
                subject_id: subject.id.clone(),
                tenant_id: subject.tenant_id.clone(),
                email,
                scheduled_hard_delete_at,
            })
            .await?;

        let mut event = AuditEvent::new(
            subject.tenant_id.as_str(),
            ActorType::System,
            AuditAction::Update,
            "subject",
            &subject.id,
        );
        event.actor_id = Some(subject.id.clone());
        event.metadata = Some(serde_json::json!({ "stage": "deletion_notice" }));
        if let Err(e) = self.publisher.publish(event).await {
            warn!(subject_id = %subject.id, error = ?e, "failed to publish notice event");
        }

        Ok(true)
    }

    /// Hard-delete everything past the retention window, oldest first. A
    /// failure on one subject is logged and does not stop the batch.
    pub async fn run_hard_delete_pass(&self, now: DateTime<Utc>) -> Result<u64, CommonError> {
        let (retention_days, _) = self.effective_windows().await?;
        let cutoff = WrappedChronoDateTime::new(now - Duration::days(retention_days));

        let eligible = self
            .repository
            .list_hard_delete_eligible(cutoff, self.settings.hard_delete_batch_size)
            .await?;

        let mut hard_deleted = 0;
        for subject in eligible {
            match self.hard_delete_subject(&subject).await {
                Ok(()) => hard_deleted += 1,
                Err(e) => {
                    warn!(subject_id = %subject.id, error = ?e, "hard delete failed");
                }
            }
        }
        Ok(hard_deleted)
    }

    async fn hard_delete_subject(&self, subject: &SubjectRow) -> Result<(), CommonError> {
        let placeholder = format!("anonymized-{}", uuid::Uuid::new_v4());
        let outcome = self
            .repository
            .hard_delete_subject(subject, &placeholder)
            .await?;

        info!(
            subject_id = %subject.id,
            sessions_deleted = outcome.sessions_deleted,
            invitations_deleted = outcome.invitations_deleted,
            audit_rows_anonymized = outcome.audit_rows_anonymized,
            "subject hard-deleted"
        );

        // The confirming event carries the placeholder, not the subject id,
        // so the trail holds no link back to the erased identity.
        let mut event = AuditEvent::new(
            subject.tenant_id.as_str(),
            ActorType::System,
            AuditAction::Anonymize,
            "subject",
            placeholder.as_str(),
        );
        event.metadata = Some(serde_json::json!({
            "sessions_deleted": outcome.sessions_deleted,
            "invitations_deleted": outcome.invitations_deleted,
            "audit_rows_anonymized": outcome.audit_rows_anonymized,
        }));
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = ?e, "failed to publish anonymize event");
        }

        Ok(())
    }

    pub async fn run_cleanup_pass(&self, now: DateTime<Utc>) -> Result<CleanupReport, CommonError> {
        let notified = self.run_notify_pass(now).await?;
        let hard_deleted = self.run_hard_delete_pass(now).await?;
        Ok(CleanupReport {
            notified,
            hard_deleted,
        })
    }
}
