use anyhow::Context;
use async_trait::async_trait;
use shared::{
    error::CommonError,
    primitives::{SqlMigrationLoader, WrappedChronoDateTime},
};
use shared_macros::load_atlas_sql_migrations;
use std::collections::BTreeMap;

use crate::logic::policy::RetentionPolicy;
use crate::repository::{
    CreateInvitation, CreateSession, CreateSubject, HardDeleteOutcome, RetentionRepositoryLike,
    SubjectRow,
};

const SUBJECT_COLUMNS: &str = "id, tenant_id, email_ciphertext, email_hash, \
     display_name_ciphertext, created_at, updated_at, deleted_at";

const POLICY_COLUMNS: &str = "table_name, record_type, retention_period_days, grace_period_days, \
     legal_minimum_days, notification_days_before, is_active, created_at, updated_at";

#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl SqlMigrationLoader for Repository {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>> {
        load_atlas_sql_migrations!("dbs/retention/migrations")
    }
}

fn repo_err(e: anyhow::Error) -> CommonError {
    CommonError::Repository {
        msg: e.to_string(),
        source: Some(e),
    }
}

fn row_to_subject(row: &libsql::Row) -> Result<SubjectRow, CommonError> {
    Ok(SubjectRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        email_ciphertext: row.get(2)?,
        email_hash: row.get(3)?,
        display_name_ciphertext: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn row_to_policy(row: &libsql::Row) -> Result<RetentionPolicy, CommonError> {
    let is_active: i64 = row.get(6)?;
    Ok(RetentionPolicy {
        table_name: row.get(0)?,
        record_type: row.get(1)?,
        retention_period_days: row.get(2)?,
        grace_period_days: row.get(3)?,
        legal_minimum_days: row.get(4)?,
        notification_days_before: row.get(5)?,
        is_active: is_active != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl Repository {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }

    async fn query_subjects(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<SubjectRow>, CommonError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .context("Failed to query subjects")
            .map_err(repo_err)?;

        let mut subjects = Vec::new();
        while let Some(row) = rows.next().await? {
            subjects.push(row_to_subject(&row)?);
        }
        Ok(subjects)
    }

    async fn count(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<i64, CommonError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .context("Failed to run count query")
            .map_err(repo_err)?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl RetentionRepositoryLike for Repository {
    async fn create_subject(&self, params: &CreateSubject) -> Result<(), CommonError> {
        self.conn
            .execute(
                "INSERT INTO subject (id, tenant_id, email_ciphertext, email_hash, \
                 display_name_ciphertext, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                libsql::params![
                    params.id.clone(),
                    params.tenant_id.clone(),
                    params.email_ciphertext.clone(),
                    params.email_hash.clone(),
                    params.display_name_ciphertext.clone(),
                    params.created_at,
                    params.updated_at,
                ],
            )
            .await
            .context("Failed to insert subject")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn get_subject_by_id(&self, id: &str) -> Result<Option<SubjectRow>, CommonError> {
        let subjects = self
            .query_subjects(
                &format!("SELECT {SUBJECT_COLUMNS} FROM subject WHERE id = ?1"),
                libsql::params![id],
            )
            .await?;
        Ok(subjects.into_iter().next())
    }

    async fn find_subject_by_email_ciphertext(
        &self,
        tenant_id: &str,
        email_ciphertext: &str,
    ) -> Result<Option<SubjectRow>, CommonError> {
        let subjects = self
            .query_subjects(
                &format!(
                    "SELECT {SUBJECT_COLUMNS} FROM subject \
                     WHERE tenant_id = ?1 AND email_ciphertext = ?2"
                ),
                libsql::params![tenant_id, email_ciphertext],
            )
            .await?;
        Ok(subjects.into_iter().next())
    }

    async fn mark_subject_deleted(
        &self,
        id: &str,
        deleted_at: WrappedChronoDateTime,
    ) -> Result<u64, CommonError> {
        let affected = self
            .conn
            .execute(
                "UPDATE subject SET deleted_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND deleted_at IS NULL",
                libsql::params![id, deleted_at],
            )
            .await
            .context("Failed to mark subject deleted")
            .map_err(repo_err)?;
        Ok(affected)
    }

    async fn create_session(&self, params: &CreateSession) -> Result<(), CommonError> {
        self.conn
            .execute(
                "INSERT INTO session (id, subject_id, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                libsql::params![
                    params.id.clone(),
                    params.subject_id.clone(),
                    params.created_at,
                    params.expires_at,
                ],
            )
            .await
            .context("Failed to insert session")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn create_invitation(&self, params: &CreateInvitation) -> Result<(), CommonError> {
        self.conn
            .execute(
                "INSERT INTO invitation (id, tenant_id, email_ciphertext, \
                 invited_by_subject_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                libsql::params![
                    params.id.clone(),
                    params.tenant_id.clone(),
                    params.email_ciphertext.clone(),
                    params.invited_by_subject_id.clone(),
                    params.created_at,
                ],
            )
            .await
            .context("Failed to insert invitation")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn count_sessions_for_subject(&self, subject_id: &str) -> Result<i64, CommonError> {
        self.count(
            "SELECT COUNT(*) FROM session WHERE subject_id = ?1",
            libsql::params![subject_id],
        )
        .await
    }

    async fn count_pending_invitations_for_email(
        &self,
        tenant_id: &str,
        email_ciphertext: &str,
    ) -> Result<i64, CommonError> {
        self.count(
            "SELECT COUNT(*) FROM invitation \
             WHERE tenant_id = ?1 AND email_ciphertext = ?2 AND accepted_at IS NULL",
            libsql::params![tenant_id, email_ciphertext],
        )
        .await
    }

    async fn list_notify_eligible(
        &self,
        deleted_on_or_before: WrappedChronoDateTime,
        deleted_after: WrappedChronoDateTime,
        limit: i64,
    ) -> Result<Vec<SubjectRow>, CommonError> {
        self.query_subjects(
            &format!(
                "SELECT {SUBJECT_COLUMNS} FROM subject \
                 WHERE deleted_at IS NOT NULL AND deleted_at <= ?1 AND deleted_at > ?2 \
                 AND id NOT IN (SELECT subject_id FROM deletion_notification) \
                 ORDER BY deleted_at ASC LIMIT ?3"
            ),
            libsql::params![deleted_on_or_before, deleted_after, limit],
        )
        .await
    }

    async fn create_notification_marker(
        &self,
        subject_id: &str,
        notified_at: WrappedChronoDateTime,
        scheduled_hard_delete_at: WrappedChronoDateTime,
    ) -> Result<bool, CommonError> {
        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO deletion_notification \
                 (subject_id, notified_at, scheduled_hard_delete_at) VALUES (?1, ?2, ?3)",
                libsql::params![subject_id, notified_at, scheduled_hard_delete_at],
            )
            .await
            .context("Failed to insert deletion notification marker")
            .map_err(repo_err)?;
        Ok(affected == 1)
    }

    async fn list_hard_delete_eligible(
        &self,
        deleted_on_or_before: WrappedChronoDateTime,
        limit: i64,
    ) -> Result<Vec<SubjectRow>, CommonError> {
        self.query_subjects(
            &format!(
                "SELECT {SUBJECT_COLUMNS} FROM subject \
                 WHERE deleted_at IS NOT NULL AND deleted_at <= ?1 \
                 ORDER BY deleted_at ASC LIMIT ?2"
            ),
            libsql::params![deleted_on_or_before, limit],
        )
        .await
    }

    async fn hard_delete_subject(
        &self,
        subject: &SubjectRow,
        anonymized_placeholder: &str,
    ) -> Result<HardDeleteOutcome, CommonError> {
        let tx = self
            .conn
            .transaction()
            .await
            .context("Failed to open hard delete transaction")
            .map_err(repo_err)?;

        let sessions_deleted = tx
            .execute(
                "DELETE FROM session WHERE subject_id = ?1",
                libsql::params![subject.id.clone()],
            )
            .await?;

        // Pending invitations for the same address; accepted ones belong to
        // whoever accepted them and stay.
        let invitations_deleted = tx
            .execute(
                "DELETE FROM invitation \
                 WHERE tenant_id = ?1 AND email_ciphertext = ?2 AND accepted_at IS NULL",
                libsql::params![
                    subject.tenant_id.clone(),
                    subject.email_ciphertext.clone()
                ],
            )
            .await?;

        // Audit events are kept for their action/resource/timestamp trail;
        // only the actor identity is rewritten.
        let audit_rows_anonymized = tx
            .execute(
                "UPDATE audit_event SET \
                 actor_id = ?2, \
                 actor_email = CASE WHEN actor_email IS NULL THEN NULL ELSE ?2 END, \
                 metadata = json_set(coalesce(metadata, '{}'), '$.anonymized', json('true')) \
                 WHERE actor_id = ?1",
                libsql::params![subject.id.clone(), anonymized_placeholder],
            )
            .await?;

        tx.execute(
            "DELETE FROM deletion_notification WHERE subject_id = ?1",
            libsql::params![subject.id.clone()],
        )
        .await?;

        tx.execute(
            "DELETE FROM subject WHERE id = ?1",
            libsql::params![subject.id.clone()],
        )
        .await?;

        tx.commit()
            .await
            .context("Failed to commit hard delete transaction")
            .map_err(repo_err)?;

        Ok(HardDeleteOutcome {
            sessions_deleted,
            invitations_deleted,
            audit_rows_anonymized,
        })
    }

    async fn upsert_policy(&self, policy: &RetentionPolicy) -> Result<(), CommonError> {
        self.conn
            .execute(
                "INSERT INTO retention_policy (table_name, record_type, retention_period_days, \
                 grace_period_days, legal_minimum_days, notification_days_before, is_active, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT (table_name, record_type) DO UPDATE SET \
                 retention_period_days = excluded.retention_period_days, \
                 grace_period_days = excluded.grace_period_days, \
                 legal_minimum_days = excluded.legal_minimum_days, \
                 notification_days_before = excluded.notification_days_before, \
                 is_active = excluded.is_active, \
                 updated_at = excluded.updated_at",
                libsql::params![
                    policy.table_name.clone(),
                    policy.record_type.clone(),
                    policy.retention_period_days,
                    policy.grace_period_days,
                    policy.legal_minimum_days,
                    policy.notification_days_before,
                    policy.is_active as i64,
                    policy.created_at,
                    policy.updated_at,
                ],
            )
            .await
            .context("Failed to upsert retention policy")
            .map_err(repo_err)?;
        Ok(())
    }

    async fn get_policy(
        &self,
        table_name: &str,
        record_type: &str,
    ) -> Result<Option<RetentionPolicy>, CommonError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM retention_policy \
                     WHERE table_name = ?1 AND record_type = ?2"
                ),
                libsql::params![table_name, record_type],
            )
            .await
            .context("Failed to get retention policy")
            .map_err(repo_err)?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_policy(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_policies(&self) -> Result<Vec<RetentionPolicy>, CommonError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM retention_policy \
                     ORDER BY table_name, record_type"
                ),
                (),
            )
            .await
            .context("Failed to list retention policies")
            .map_err(repo_err)?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next().await? {
            policies.push(row_to_policy(&row)?);
        }
        Ok(policies)
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::Repository;
    use crate::logic::policy::RetentionPolicy;
    use crate::repository::{CreateSubject, RetentionRepositoryLike};
    use shared::primitives::{SqlMigrationLoader, WrappedChronoDateTime};
    use shared::test_utils::setup_in_memory_database;

    async fn setup_repository() -> (libsql::Database, Repository) {
        let (db, conn) = setup_in_memory_database(vec![
            Repository::load_sql_migrations(),
            audit::repository::Repository::load_sql_migrations(),
        ])
        .await
        .unwrap();
        (db, Repository::new(conn))
    }

    fn subject_params(id: &str, email_ciphertext: &str) -> CreateSubject {
        let now = WrappedChronoDateTime::now();
        CreateSubject {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            email_ciphertext: email_ciphertext.to_string(),
            email_hash: None,
            display_name_ciphertext: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_subject_by_email_ciphertext() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        repository
            .create_subject(&subject_params("sub-1", "ct-alpha"))
            .await
            .unwrap();
        repository
            .create_subject(&subject_params("sub-2", "ct-beta"))
            .await
            .unwrap();

        let found = repository
            .find_subject_by_email_ciphertext("tenant-1", "ct-beta")
            .await
            .unwrap()
            .expect("subject should exist");
        assert_eq!(found.id, "sub-2");

        let missing = repository
            .find_subject_by_email_ciphertext("tenant-2", "ct-beta")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_mark_subject_deleted_is_single_shot() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        repository
            .create_subject(&subject_params("sub-1", "ct-alpha"))
            .await
            .unwrap();

        let now = WrappedChronoDateTime::now();
        assert_eq!(repository.mark_subject_deleted("sub-1", now).await.unwrap(), 1);
        // Already soft-deleted, no rows to change
        assert_eq!(repository.mark_subject_deleted("sub-1", now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_notification_marker_inserts_once() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        repository
            .create_subject(&subject_params("sub-1", "ct-alpha"))
            .await
            .unwrap();

        let now = WrappedChronoDateTime::now();
        let scheduled = WrappedChronoDateTime::new(
            *now.get_inner() + chrono::Duration::days(30),
        );

        assert!(
            repository
                .create_notification_marker("sub-1", now, scheduled)
                .await
                .unwrap()
        );
        assert!(
            !repository
                .create_notification_marker("sub-1", now, scheduled)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_upsert_policy_overwrites_periods() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        let now = WrappedChronoDateTime::now();
        let mut policy = RetentionPolicy {
            table_name: "subject".to_string(),
            record_type: String::new(),
            retention_period_days: 90,
            grace_period_days: 7,
            legal_minimum_days: Some(30),
            notification_days_before: 30,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        repository.upsert_policy(&policy).await.unwrap();

        policy.retention_period_days = 180;
        policy.is_active = false;
        repository.upsert_policy(&policy).await.unwrap();

        let stored = repository
            .get_policy("subject", "")
            .await
            .unwrap()
            .expect("policy should exist");
        assert_eq!(stored.retention_period_days, 180);
        assert!(!stored.is_active);
        assert_eq!(stored.legal_minimum_days, Some(30));
        assert_eq!(repository.list_policies().await.unwrap().len(), 1);
    }
}
