// Delivery channels for audit events. The HTTP channel posts keyed records
// to a broker gateway topic; the store channel persists directly to the
// local audit table for single-node deployments; the recording channel is
// an in-memory fake for tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use shared::error::CommonError;
use url::Url;

use crate::logic::event::AuditEvent;
use crate::repository::AuditEventRepositoryLike;

/// A keyed record on its way to the audit topic. The key is the event id,
/// so records for the same event land in the same partition.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelRecord {
    pub key: String,
    pub payload: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait AuditChannelLike: Send + Sync {
    async fn send(&self, record: ChannelRecord) -> Result<(), CommonError>;

    /// Deliver a batch as one channel-level write. All records are accepted
    /// or none are.
    async fn send_batch(&self, records: Vec<ChannelRecord>) -> Result<(), CommonError>;
}

#[derive(Serialize)]
struct ProduceRequest<'a> {
    records: &'a [ChannelRecord],
}

/// Producer posting keyed records to a broker gateway. Requires full
/// acknowledgment from the gateway; the topic must already exist.
#[derive(Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    topic: String,
}

impl HttpChannel {
    pub fn new(base_url: Url, token: Option<String>, topic: String) -> Result<Self, CommonError> {
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
            topic,
        })
    }

    async fn produce(&self, records: &[ChannelRecord]) -> Result<(), CommonError> {
        let url = format!(
            "{}/topics/{}/records",
            self.base_url.as_str().trim_end_matches('/'),
            self.topic
        );

        let mut request = self.client.post(&url).json(&ProduceRequest { records });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommonError::Transport {
                msg: format!("audit gateway returned {status} for {url}: {body}"),
                source: None,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl AuditChannelLike for HttpChannel {
    async fn send(&self, record: ChannelRecord) -> Result<(), CommonError> {
        self.produce(std::slice::from_ref(&record)).await
    }

    async fn send_batch(&self, records: Vec<ChannelRecord>) -> Result<(), CommonError> {
        if records.is_empty() {
            return Ok(());
        }
        self.produce(&records).await
    }
}

/// Persist events straight into the audit table, bypassing the broker.
pub struct StoreChannel<R> {
    repository: R,
}

impl<R> StoreChannel<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl<R> AuditChannelLike for StoreChannel<R>
where
    R: AuditEventRepositoryLike + Send + Sync,
{
    async fn send(&self, record: ChannelRecord) -> Result<(), CommonError> {
        let event: AuditEvent = serde_json::from_str(&record.payload)?;
        self.repository.insert_event(&event).await
    }

    async fn send_batch(&self, records: Vec<ChannelRecord>) -> Result<(), CommonError> {
        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            events.push(serde_json::from_str::<AuditEvent>(&record.payload)?);
        }
        self.repository.insert_events(&events).await
    }
}

/// In-memory channel recording everything it is asked to deliver.
#[derive(Default)]
pub struct RecordingChannel {
    records: tokio::sync::Mutex<Vec<ChannelRecord>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ChannelRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditChannelLike for RecordingChannel {
    async fn send(&self, record: ChannelRecord) -> Result<(), CommonError> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn send_batch(&self, records: Vec<ChannelRecord>) -> Result<(), CommonError> {
        self.records.lock().await.extend(records);
        Ok(())
    }
}
