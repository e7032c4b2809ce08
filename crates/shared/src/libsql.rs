use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;

use libsql::params::IntoParams;
use libsql::{BatchRows, Database, Rows, Transaction};
use tracing::info;
use url::Url;

use crate::error::CommonError;

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            // Very low delay with exponential backoff
                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            tracing::error!("Error executing with retry: {:?}", err);
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute a sql statement, retrying while the database is locked,
    /// returning on success the number of rows that were changed.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute a batch set of statements.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10)
    }

    /// Execute a batch set of statements atomically in a transaction.
    pub async fn execute_transactional_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch transactional `{}`", sql);
        execute_with_retry!(self.0.execute_transactional_batch(sql), 10)
    }

    /// Run a sql query, retrying while the database is locked, returning
    /// the matching [`Rows`].
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        let mut stmt = self.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }

    /// Open a transaction on the underlying connection. The transaction
    /// rolls back when dropped without an explicit commit.
    pub async fn transaction(&self) -> libsql::Result<Transaction> {
        self.0.transaction().await
    }
}

pub struct LocalConnectionParams {
    pub path_to_db_file: PathBuf,
}

pub struct RemoteConnectionParams {
    pub remote_url: String,
    pub auth_token: String,
}

pub enum ConnectionType {
    Local(LocalConnectionParams),
    Remote(RemoteConnectionParams),
}

fn get_libsql_path(url_str: &str) -> Result<String, CommonError> {
    // Extract the path portion after libsql://
    let is_relative = url_str.starts_with("libsql://./");
    let url = Url::parse(url_str)?;

    if is_relative {
        Ok(format!(".{}", url.path()))
    } else {
        Ok(url.path().to_string())
    }
}

impl TryFrom<Url> for ConnectionType {
    type Error = CommonError;
    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if url.scheme() != "libsql" {
            let scheme = url.scheme();
            return Err(CommonError::Unknown(anyhow::anyhow!(
                "invalid scheme: {scheme}"
            )));
        }

        let mode = match url
            .query_pairs()
            .find(|(key, _)| key == "mode")
            .map(|(_, value)| value.to_string())
        {
            Some(mode) => mode,
            None => {
                return Err(CommonError::Unknown(anyhow::anyhow!(
                    "missing mode query parameter"
                )));
            }
        };

        match mode.as_str() {
            "local" => Ok(ConnectionType::Local(LocalConnectionParams {
                path_to_db_file: PathBuf::from(get_libsql_path(url.as_ref())?),
            })),
            "remote" => {
                let mut remote_url = url.clone();
                remote_url.set_query(None);

                let auth_token = match url.query_pairs().find(|(key, _)| key == "auth") {
                    Some((_, value)) => value.to_string(),
                    None => {
                        return Err(CommonError::Unknown(anyhow::anyhow!(
                            "missing auth query parameter for remote connection"
                        )));
                    }
                };

                Ok(ConnectionType::Remote(RemoteConnectionParams {
                    remote_url: remote_url.to_string(),
                    auth_token,
                }))
            }
            _ => Err(CommonError::Unknown(anyhow::anyhow!(
                "invalid mode: {mode}"
            ))),
        }
    }
}

pub type Migrations<'a> = BTreeMap<&'a str, BTreeMap<&'a str, &'a str>>;

pub fn merge_nested_migrations<'a>(mergable_migrations: Vec<Migrations<'a>>) -> Migrations<'a> {
    let mut target = Migrations::new();
    for other in mergable_migrations {
        for (outer_key, inner_map) in other {
            target
                .entry(outer_key)
                .and_modify(|existing_inner| {
                    for (inner_key, value) in inner_map.iter() {
                        existing_inner.insert(*inner_key, *value);
                    }
                })
                .or_insert(inner_map);
        }
    }
    target
}

/// Apply the `.up.sql` entries of the merged migration set in filename order.
/// Applied filenames are tracked in `_migrations` so reconnecting against an
/// existing database is a no-op.
pub async fn apply_migrations<'a>(
    conn: &Connection,
    migrations: &Migrations<'a>,
) -> Result<(), CommonError> {
    let sqlite_migrations = migrations.get("sqlite").ok_or_else(|| {
        CommonError::Unknown(anyhow::anyhow!("no sqlite migrations in migration set"))
    })?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (filename TEXT PRIMARY KEY, applied_at DATETIME NOT NULL DEFAULT (datetime('now')))",
        (),
    )
    .await?;

    for (filename, contents) in sqlite_migrations
        .iter()
        .filter(|(filename, _)| filename.contains(".up."))
    {
        let mut rows = conn
            .query(
                "SELECT filename FROM _migrations WHERE filename = ?1",
                libsql::params![*filename],
            )
            .await?;
        if rows.next().await?.is_some() {
            tracing::trace!("skipping already applied migration `{}`", filename);
            continue;
        }

        tracing::debug!("applying migration `{}`", filename);
        conn.execute_batch(contents).await?;
        conn.execute(
            "INSERT INTO _migrations (filename) VALUES (?1)",
            libsql::params![*filename],
        )
        .await?;
    }

    Ok(())
}

pub async fn establish_db_connection<'a>(
    connection_string: &Url,
    migrations: Option<Migrations<'a>>,
) -> Result<(Database, Connection), CommonError> {
    let connection_type = ConnectionType::try_from(connection_string.clone())?;

    let (db, conn) = match connection_type {
        ConnectionType::Local(params) => {
            info!("establishing local connection");
            if let Some(parent) = params.path_to_db_file.parent()
                && !std::fs::exists(parent)?
            {
                std::fs::create_dir_all(parent)?;
            }

            let db = libsql::Builder::new_local(params.path_to_db_file.clone())
                .build()
                .await?;
            let conn = db.connect()?;
            (db, conn)
        }
        ConnectionType::Remote(params) => {
            info!("establishing remote connection");
            let db =
                libsql::Builder::new_remote(params.remote_url.clone(), params.auth_token.clone())
                    .build()
                    .await?;
            let conn = db.connect()?;
            (db, conn)
        }
    };

    let conn = Connection(conn);

    if let Some(migrations) = migrations {
        apply_migrations(&conn, &migrations).await?;
    }

    Ok((db, conn))
}
