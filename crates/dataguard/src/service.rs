use std::path::Path;
use std::sync::Arc;

use audit::channel::{AuditChannelLike, HttpChannel, StoreChannel};
use audit::AuditPublisher;
use field_cipher::{FieldCipher, KeyServiceLike, LocalKeyService, TransitClient};
use retention::repository::Repository as RetentionRepository;
use retention::{
    CleanupScheduler, DeletionLifecycle, LifecycleSettings, LogNoticeSender,
    cleanup_scheduler_task,
};
use shared::libsql::{Migrations, establish_db_connection, merge_nested_migrations};
use shared::primitives::SqlMigrationLoader;
use shared::subsystem::{SubsystemHandle, spawn_subsystem};
use shared::error::CommonError;
use tokio::sync::broadcast;
use url::Url;

use crate::config::DataguardConfig;

/// Holds every dependency for data-protection operations. Retention and
/// audit repositories share one database so hard deletion and audit
/// anonymization commit atomically.
#[derive(Clone)]
pub struct DataProtectionService {
    pub repository: RetentionRepository,
    pub audit_repository: audit::repository::Repository,
    pub cipher: Arc<FieldCipher>,
    pub publisher: AuditPublisher,
    pub lifecycle: Arc<DeletionLifecycle<RetentionRepository>>,
}

pub fn migrations() -> Migrations<'static> {
    merge_nested_migrations(vec![
        RetentionRepository::load_sql_migrations(),
        audit::repository::Repository::load_sql_migrations(),
    ])
}

fn build_key_service(config: &DataguardConfig) -> Result<Arc<dyn KeyServiceLike>, CommonError> {
    if let Some(addr) = &config.transit_addr {
        let token = config
            .transit_token
            .clone()
            .ok_or_else(|| CommonError::Validation {
                msg: "TRANSIT_TOKEN is required when TRANSIT_ADDR is set".to_string(),
                source: None,
            })?;
        let client = TransitClient::new(Url::parse(addr)?, token, config.key_name.clone())?;
        return Ok(Arc::new(client));
    }

    if let Some(file) = &config.local_key_file {
        let service = LocalKeyService::get_or_create(Path::new(file), config.key_name.clone())?;
        return Ok(Arc::new(service));
    }

    Err(CommonError::Validation {
        msg: "either TRANSIT_ADDR or LOCAL_KEY_FILE must be configured".to_string(),
        source: None,
    })
}

pub async fn build_data_protection_service(
    config: &DataguardConfig,
) -> Result<(libsql::Database, DataProtectionService), CommonError> {
    let conn_string = Url::parse(&config.db_conn_string)?;
    let (db, conn) = establish_db_connection(&conn_string, Some(migrations())).await?;

    let repository = RetentionRepository::new(conn.clone());
    let audit_repository = audit::repository::Repository::new(conn);

    let key_service = build_key_service(config)?;
    let cipher = Arc::new(FieldCipher::new(
        key_service,
        config.search_hash_secret.as_bytes().to_vec(),
    )?);

    let channel: Arc<dyn AuditChannelLike> = match &config.audit_gateway_addr {
        Some(addr) => Arc::new(HttpChannel::new(
            Url::parse(addr)?,
            config.audit_gateway_token.clone(),
            config.audit_topic.clone(),
        )?),
        None => Arc::new(StoreChannel::new(audit_repository.clone())),
    };
    let publisher = AuditPublisher::new(channel, config.service_name.clone());

    let lifecycle = Arc::new(DeletionLifecycle::new(
        repository.clone(),
        cipher.clone(),
        publisher.clone(),
        Arc::new(LogNoticeSender),
        LifecycleSettings {
            retention_days: config.retention_days,
            notice_lead_days: config.notice_lead_days,
            hard_delete_batch_size: config.hard_delete_batch_size,
        },
    )?);

    Ok((
        db,
        DataProtectionService {
            repository,
            audit_repository,
            cipher,
            publisher,
            lifecycle,
        },
    ))
}

/// Spawn the daily cleanup loop as a supervised subsystem. The returned
/// scheduler handle can force a pass outside the daily schedule.
pub fn start_cleanup_subsystem(
    lifecycle: Arc<DeletionLifecycle<RetentionRepository>>,
    run_hour_utc: u32,
    shutdown_tx: &broadcast::Sender<()>,
) -> (CleanupScheduler, SubsystemHandle) {
    let (scheduler, trigger_rx) = CleanupScheduler::channel();
    let handle = spawn_subsystem(
        "cleanup-scheduler",
        shutdown_tx.subscribe(),
        cleanup_scheduler_task(lifecycle, run_hour_utc, trigger_rx, shutdown_tx.subscribe()),
    );
    (scheduler, handle)
}
