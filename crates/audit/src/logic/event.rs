use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    Guest,
    Admin,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::System => "system",
            ActorType::Guest => "guest",
            ActorType::Admin => "admin",
        }
    }
}

impl FromStr for ActorType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorType::User),
            "system" => Ok(ActorType::System),
            "guest" => Ok(ActorType::Guest),
            "admin" => Ok(ActorType::Admin),
            _ => Err(CommonError::Validation {
                msg: format!("invalid actor_type: {s}"),
                source: None,
            }),
        }
    }
}

impl From<ActorType> for libsql::Value {
    fn from(value: ActorType) -> Self {
        libsql::Value::Text(value.as_str().to_string())
    }
}

impl libsql::FromValue for ActorType {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => {
                ActorType::from_str(&s).map_err(|_e| libsql::Error::InvalidColumnType)
            }
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Access,
    Export,
    Anonymize,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Read => "READ",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Access => "ACCESS",
            AuditAction::Export => "EXPORT",
            AuditAction::Anonymize => "ANONYMIZE",
        }
    }
}

impl FromStr for AuditAction {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(AuditAction::Create),
            "READ" => Ok(AuditAction::Read),
            "UPDATE" => Ok(AuditAction::Update),
            "DELETE" => Ok(AuditAction::Delete),
            "ACCESS" => Ok(AuditAction::Access),
            "EXPORT" => Ok(AuditAction::Export),
            "ANONYMIZE" => Ok(AuditAction::Anonymize),
            _ => Err(CommonError::Validation {
                msg: format!("invalid action: {s}"),
                source: None,
            }),
        }
    }
}

impl From<AuditAction> for libsql::Value {
    fn from(value: AuditAction) -> Self {
        libsql::Value::Text(value.as_str().to_string())
    }
}

impl libsql::FromValue for AuditAction {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => {
                AuditAction::from_str(&s).map_err(|_e| libsql::Error::InvalidColumnType)
            }
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

/// One auditable action. `event_id`, `timestamp` and `service_name` may be
/// left unset by callers; the publisher fills them before emission. The
/// serialized JSON form is the contract consumed downstream.
///
/// `before_value` / `after_value` carry already-encrypted or non-PII
/// representations only; the publisher never encrypts on behalf of the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WrappedChronoDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub tenant_id: String,
    pub actor_type: ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_email: Option<String>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_value: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_value: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        actor_type: ActorType,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: None,
            timestamp: None,
            service_name: None,
            tenant_id: tenant_id.into(),
            actor_type,
            actor_id: None,
            actor_email: None,
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            purpose: None,
            consent_id: None,
            before_value: None,
            after_value: None,
            metadata: None,
        }
    }

    /// Check required fields. Defaulted fields are validated too, so this
    /// must run after the publisher has filled them in.
    pub fn validate(&self) -> Result<(), CommonError> {
        fn required(field: &str, value: Option<&str>) -> Result<(), CommonError> {
            match value {
                Some(v) if !v.is_empty() => Ok(()),
                _ => Err(CommonError::Validation {
                    msg: format!("audit event is missing required field: {field}"),
                    source: None,
                }),
            }
        }

        required("event_id", self.event_id.as_deref())?;
        required("service_name", self.service_name.as_deref())?;
        required("tenant_id", Some(self.tenant_id.as_str()))?;
        required("resource_type", Some(self.resource_type.as_str()))?;
        required("resource_id", Some(self.resource_id.as_str()))?;

        if self.timestamp.is_none() {
            return Err(CommonError::Validation {
                msg: "audit event is missing required field: timestamp".to_string(),
                source: None,
            });
        }

        Ok(())
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::str::FromStr;

    use super::{ActorType, AuditAction, AuditEvent};
    use shared::error::CommonError;

    #[test]
    fn test_unknown_actor_type_rejected() {
        let result = ActorType::from_str("robot");
        assert!(matches!(result, Err(CommonError::Validation { .. })));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result = AuditAction::from_str("OBLITERATE");
        assert!(matches!(result, Err(CommonError::Validation { .. })));
    }

    #[test]
    fn test_action_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&AuditAction::Anonymize).unwrap();
        assert_eq!(json, "\"ANONYMIZE\"");
    }

    #[test]
    fn test_validate_rejects_empty_tenant() {
        let mut event = AuditEvent::new(
            "",
            ActorType::User,
            AuditAction::Create,
            "user",
            "user-1",
        );
        event.event_id = Some("evt-1".to_string());
        event.service_name = Some("test".to_string());
        event.timestamp = Some(shared::primitives::WrappedChronoDateTime::now());

        assert!(matches!(
            event.validate(),
            Err(CommonError::Validation { .. })
        ));
    }
}
