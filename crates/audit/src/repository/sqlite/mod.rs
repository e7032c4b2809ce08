use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use shared::{
    error::CommonError,
    primitives::{
        PaginatedResponse, PaginationRequest, SqlMigrationLoader, WrappedChronoDateTime,
        decode_pagination_token,
    },
};
use shared_macros::load_atlas_sql_migrations;
use std::collections::BTreeMap;

use crate::logic::event::AuditEvent;
use crate::repository::{AuditEventRepositoryLike, StoredAuditEvent};

const EVENT_COLUMNS: &str = "event_id, tenant_id, actor_type, actor_id, actor_email, action, \
     resource_type, resource_id, purpose, consent_id, before_value, after_value, metadata, \
     service_name, occurred_at";

#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl SqlMigrationLoader for Repository {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>> {
        load_atlas_sql_migrations!("dbs/audit/migrations")
    }
}

fn to_json_text<T: Serialize>(value: &Option<T>) -> Result<Option<String>, CommonError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(CommonError::from)
}

fn row_to_event(row: &libsql::Row) -> Result<StoredAuditEvent, CommonError> {
    Ok(StoredAuditEvent {
        event_id: row.get(0)?,
        tenant_id: row.get(1)?,
        actor_type: row.get(2)?,
        actor_id: row.get(3)?,
        actor_email: row.get(4)?,
        action: row.get(5)?,
        resource_type: row.get(6)?,
        resource_id: row.get(7)?,
        purpose: row.get(8)?,
        consent_id: row.get(9)?,
        before_value: row.get(10)?,
        after_value: row.get(11)?,
        metadata: row.get(12)?,
        service_name: row.get(13)?,
        occurred_at: row.get(14)?,
    })
}

struct InsertParams {
    event_id: String,
    service_name: String,
    occurred_at: WrappedChronoDateTime,
    before_value: Option<String>,
    after_value: Option<String>,
    metadata: Option<String>,
}

/// Pull the publisher-defaulted fields out of the wire event, rejecting
/// events that never went through the publisher.
fn insert_params(event: &AuditEvent) -> Result<InsertParams, CommonError> {
    let event_id = event.event_id.clone().ok_or_else(|| CommonError::Validation {
        msg: "cannot persist audit event without event_id".to_string(),
        source: None,
    })?;
    let service_name = event
        .service_name
        .clone()
        .ok_or_else(|| CommonError::Validation {
            msg: "cannot persist audit event without service_name".to_string(),
            source: None,
        })?;
    let occurred_at = event.timestamp.ok_or_else(|| CommonError::Validation {
        msg: "cannot persist audit event without timestamp".to_string(),
        source: None,
    })?;

    Ok(InsertParams {
        event_id,
        service_name,
        occurred_at,
        before_value: to_json_text(&event.before_value)?,
        after_value: to_json_text(&event.after_value)?,
        metadata: to_json_text(&event.metadata)?,
    })
}

impl Repository {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }

    async fn insert_with(
        conn: &libsql::Connection,
        event: &AuditEvent,
    ) -> Result<(), CommonError> {
        let params = insert_params(event)?;

        conn.execute(
            "INSERT INTO audit_event (event_id, tenant_id, actor_type, actor_id, actor_email, \
             action, resource_type, resource_id, purpose, consent_id, before_value, after_value, \
             metadata, service_name, occurred_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            libsql::params![
                params.event_id,
                event.tenant_id.clone(),
                event.actor_type,
                event.actor_id.clone(),
                event.actor_email.clone(),
                event.action,
                event.resource_type.clone(),
                event.resource_id.clone(),
                event.purpose.clone(),
                event.consent_id.clone(),
                params.before_value,
                params.after_value,
                params.metadata,
                params.service_name,
                params.occurred_at,
            ],
        )
        .await
        .context("Failed to insert audit event")
        .map_err(|e| CommonError::Repository {
            msg: e.to_string(),
            source: Some(e),
        })?;

        Ok(())
    }
}

#[async_trait]
impl AuditEventRepositoryLike for Repository {
    async fn insert_event(&self, event: &AuditEvent) -> Result<(), CommonError> {
        Self::insert_with(&self.conn, event).await
    }

    async fn insert_events(&self, events: &[AuditEvent]) -> Result<(), CommonError> {
        let tx = self
            .conn
            .transaction()
            .await
            .context("Failed to open audit insert transaction")
            .map_err(|e| CommonError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;

        for event in events {
            Self::insert_with(&tx, event).await?;
        }

        tx.commit()
            .await
            .context("Failed to commit audit insert transaction")
            .map_err(|e| CommonError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;

        Ok(())
    }

    async fn get_event_by_id(
        &self,
        event_id: &str,
    ) -> Result<Option<StoredAuditEvent>, CommonError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM audit_event WHERE event_id = ?1"),
                libsql::params![event_id],
            )
            .await
            .context("Failed to get audit event by id")
            .map_err(|e| CommonError::Repository {
                msg: e.to_string(),
                source: Some(e),
            })?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_event(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_events_for_actor(
        &self,
        actor_id: &str,
        pagination: &PaginationRequest,
    ) -> Result<PaginatedResponse<StoredAuditEvent>, CommonError> {
        // Cursor is (occurred_at, event_id), newest first
        let cursor = match &pagination.next_page_token {
            Some(token) => {
                let parts = decode_pagination_token(token).map_err(|e| CommonError::Repository {
                    msg: format!("Invalid pagination token: {e}"),
                    source: Some(e),
                })?;
                if parts.len() != 2 {
                    return Err(CommonError::Repository {
                        msg: "Invalid pagination token: expected two parts".to_string(),
                        source: None,
                    });
                }
                let occurred_at =
                    WrappedChronoDateTime::try_from(parts[0].as_str()).map_err(|e| {
                        CommonError::Repository {
                            msg: format!("Invalid datetime in pagination token: {e}"),
                            source: Some(e),
                        }
                    })?;
                Some((occurred_at, parts[1].clone()))
            }
            None => None,
        };

        let mut rows = match cursor {
            Some((occurred_at, event_id)) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM audit_event \
                             WHERE actor_id = ?1 AND (occurred_at < ?2 OR (occurred_at = ?2 AND event_id < ?3)) \
                             ORDER BY occurred_at DESC, event_id DESC LIMIT ?4"
                        ),
                        libsql::params![
                            actor_id,
                            occurred_at,
                            event_id,
                            pagination.page_size + 1
                        ],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM audit_event WHERE actor_id = ?1 \
                             ORDER BY occurred_at DESC, event_id DESC LIMIT ?2"
                        ),
                        libsql::params![actor_id, pagination.page_size + 1],
                    )
                    .await
            }
        }
        .context("Failed to list audit events for actor")
        .map_err(|e| CommonError::Repository {
            msg: e.to_string(),
            source: Some(e),
        })?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(row_to_event(&row)?);
        }

        Ok(PaginatedResponse::from_items_with_extra(
            items,
            pagination,
            |item| {
                vec![
                    item.occurred_at.get_inner().to_rfc3339(),
                    item.event_id.clone(),
                ]
            },
        ))
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::sync::Arc;

    use super::Repository;
    use crate::channel::StoreChannel;
    use crate::logic::event::{ActorType, AuditAction, AuditEvent};
    use crate::logic::publisher::AuditPublisher;
    use crate::repository::AuditEventRepositoryLike;
    use shared::primitives::{PaginationRequest, SqlMigrationLoader, WrappedChronoDateTime};
    use shared::test_utils::setup_in_memory_database;

    async fn setup_repository() -> (libsql::Database, Repository) {
        let (db, conn) = setup_in_memory_database(vec![Repository::load_sql_migrations()])
            .await
            .unwrap();
        (db, Repository::new(conn))
    }

    fn stored_event(actor_id: &str, occurred_at: WrappedChronoDateTime) -> AuditEvent {
        let mut event = AuditEvent::new(
            "tenant-1",
            ActorType::User,
            AuditAction::Access,
            "document",
            "doc-1",
        );
        event.event_id = Some(uuid::Uuid::new_v4().to_string());
        event.service_name = Some("test-service".to_string());
        event.timestamp = Some(occurred_at);
        event.actor_id = Some(actor_id.to_string());
        event
    }

    #[tokio::test]
    async fn test_insert_and_get_event() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        let mut event = stored_event("user-1", WrappedChronoDateTime::now());
        event.metadata = Some(serde_json::json!({"reason": "export"}));
        repository.insert_event(&event).await.unwrap();

        let stored = repository
            .get_event_by_id(event.event_id.as_deref().unwrap())
            .await
            .unwrap()
            .expect("event should exist");

        assert_eq!(stored.tenant_id, "tenant-1");
        assert_eq!(stored.action.as_str(), "ACCESS");
        assert_eq!(
            stored.metadata.unwrap().get_inner()["reason"],
            serde_json::json!("export")
        );
    }

    #[tokio::test]
    async fn test_insert_rejects_unprepared_event() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        // No event_id/timestamp/service_name set
        let event = AuditEvent::new(
            "tenant-1",
            ActorType::User,
            AuditAction::Create,
            "user",
            "user-1",
        );
        let result = repository.insert_event(&event).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_events_for_actor_paginates() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        let base = chrono::Utc::now();
        for offset in 0..5 {
            let occurred_at =
                WrappedChronoDateTime::new(base - chrono::Duration::minutes(offset));
            repository
                .insert_event(&stored_event("user-1", occurred_at))
                .await
                .unwrap();
        }
        // Another actor's event must not appear
        repository
            .insert_event(&stored_event("user-2", WrappedChronoDateTime::new(base)))
            .await
            .unwrap();

        let first_page = repository
            .list_events_for_actor(
                "user-1",
                &PaginationRequest {
                    page_size: 3,
                    next_page_token: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(first_page.items.len(), 3);
        let token = first_page.next_page_token.expect("should have more pages");

        let second_page = repository
            .list_events_for_actor(
                "user-1",
                &PaginationRequest {
                    page_size: 3,
                    next_page_token: Some(token),
                },
            )
            .await
            .unwrap();

        assert_eq!(second_page.items.len(), 2);
        assert!(second_page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_store_channel_persists_published_events() {
        shared::setup_test!();
        let (_db, repository) = setup_repository().await;

        let publisher = AuditPublisher::new(
            Arc::new(StoreChannel::new(repository.clone())),
            "test-service",
        );

        let mut event = AuditEvent::new(
            "tenant-1",
            ActorType::System,
            AuditAction::Delete,
            "user",
            "user-9",
        );
        event.actor_id = Some("user-9".to_string());

        let published = publisher.publish(event).await.unwrap();

        let stored = repository
            .get_event_by_id(published.event_id.as_deref().unwrap())
            .await
            .unwrap()
            .expect("published event should be persisted");
        assert_eq!(stored.service_name, "test-service");
    }
}
