use std::collections::BTreeMap;
use std::sync::Arc;

use shared::{
    error::CommonError,
    primitives::{WrappedChronoDateTime, WrappedUuidV4},
};

use crate::channel::{AuditChannelLike, ChannelRecord};
use crate::logic::event::AuditEvent;

/// Publishes audit events to the configured channel, keyed by event id.
///
/// Callers treat publish failure as non-fatal to the business mutation the
/// event describes: log it and move on, never roll back.
#[derive(Clone)]
pub struct AuditPublisher {
    channel: Arc<dyn AuditChannelLike>,
    service_name: String,
}

impl AuditPublisher {
    pub fn new(channel: Arc<dyn AuditChannelLike>, service_name: impl Into<String>) -> Self {
        Self {
            channel,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn prepare(&self, mut event: AuditEvent) -> Result<AuditEvent, CommonError> {
        if event.event_id.is_none() {
            event.event_id = Some(WrappedUuidV4::new().to_string());
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(WrappedChronoDateTime::now());
        }
        event.service_name = Some(self.service_name.clone());

        event.validate()?;
        Ok(event)
    }

    fn to_record(event: &AuditEvent) -> Result<ChannelRecord, CommonError> {
        let event_id = event.event_id.clone().ok_or_else(|| {
            CommonError::Validation {
                msg: "audit event is missing required field: event_id".to_string(),
                source: None,
            }
        })?;

        Ok(ChannelRecord {
            key: event_id,
            payload: serde_json::to_string(event)?,
            headers: BTreeMap::new(),
        })
    }

    /// Default missing identifiers, stamp the service name, validate and
    /// emit. Returns the event as emitted so callers can log its id.
    pub async fn publish(&self, event: AuditEvent) -> Result<AuditEvent, CommonError> {
        let event = self.prepare(event)?;
        let record = Self::to_record(&event)?;

        tracing::debug!(
            event_id = event.event_id.as_deref().unwrap_or(""),
            action = event.action.as_str(),
            "publishing audit event"
        );

        self.channel.send(record).await?;
        Ok(event)
    }

    /// Publish a batch all-or-nothing. Any invalid event fails the whole
    /// batch before anything is sent, with the offending index attached.
    pub async fn publish_batch(
        &self,
        events: Vec<AuditEvent>,
    ) -> Result<Vec<AuditEvent>, CommonError> {
        let mut prepared = Vec::with_capacity(events.len());
        let mut records = Vec::with_capacity(events.len());

        for (index, event) in events.into_iter().enumerate() {
            let event = self.prepare(event).map_err(|e| e.at_batch_index(index))?;
            records.push(Self::to_record(&event).map_err(|e| e.at_batch_index(index))?);
            prepared.push(event);
        }

        self.channel.send_batch(records).await?;
        Ok(prepared)
    }
}
