use envconfig::Envconfig;
use shared::error::CommonError;

/// Process configuration, resolved once at startup. A bad value here is
/// fatal; nothing falls back silently.
///
/// Key material selection: `TRANSIT_ADDR` wins when set, otherwise
/// `LOCAL_KEY_FILE`; configuring neither is an error. `KEY_NAME` names the
/// logical key in both backends.
#[derive(Envconfig, Clone)]
pub struct DataguardConfig {
    #[envconfig(from = "DB_CONN_STRING", default = "libsql://./data/dataguard.db?mode=local")]
    pub db_conn_string: String,

    #[envconfig(from = "TRANSIT_ADDR")]
    pub transit_addr: Option<String>,

    #[envconfig(from = "TRANSIT_TOKEN")]
    pub transit_token: Option<String>,

    #[envconfig(from = "KEY_NAME", default = "dataguard-fields")]
    pub key_name: String,

    #[envconfig(from = "LOCAL_KEY_FILE")]
    pub local_key_file: Option<String>,

    #[envconfig(from = "SEARCH_HASH_SECRET")]
    pub search_hash_secret: String,

    #[envconfig(from = "AUDIT_GATEWAY_ADDR")]
    pub audit_gateway_addr: Option<String>,

    #[envconfig(from = "AUDIT_GATEWAY_TOKEN")]
    pub audit_gateway_token: Option<String>,

    #[envconfig(from = "AUDIT_TOPIC", default = "audit-events")]
    pub audit_topic: String,

    #[envconfig(from = "SERVICE_NAME", default = "dataguard")]
    pub service_name: String,

    #[envconfig(from = "CLEANUP_HOUR_UTC", default = "3")]
    pub cleanup_hour_utc: u32,

    #[envconfig(from = "RETENTION_DAYS", default = "90")]
    pub retention_days: i64,

    #[envconfig(from = "NOTICE_LEAD_DAYS", default = "30")]
    pub notice_lead_days: i64,

    #[envconfig(from = "HARD_DELETE_BATCH_SIZE", default = "100")]
    pub hard_delete_batch_size: i64,
}

impl DataguardConfig {
    /// Load .env files and resolve the configuration from the environment.
    pub fn load() -> Result<Self, CommonError> {
        shared::env::load_optional_env_files();
        Self::init_from_env().map_err(|e| CommonError::Validation {
            msg: format!("invalid configuration: {e}"),
            source: Some(anyhow::Error::from(e)),
        })
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use envconfig::Envconfig;
    use std::collections::HashMap;

    use super::DataguardConfig;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([(
            "SEARCH_HASH_SECRET".to_string(),
            "test-secret".to_string(),
        )])
    }

    #[test]
    fn test_defaults_apply() {
        let config = DataguardConfig::init_from_hashmap(&base_env()).unwrap();
        assert_eq!(
            config.db_conn_string,
            "libsql://./data/dataguard.db?mode=local"
        );
        assert_eq!(config.service_name, "dataguard");
        assert_eq!(config.cleanup_hour_utc, 3);
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.notice_lead_days, 30);
        assert!(config.transit_addr.is_none());
        assert!(config.local_key_file.is_none());
    }

    #[test]
    fn test_missing_search_secret_is_fatal() {
        let result = DataguardConfig::init_from_hashmap(&HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_win() {
        let mut env = base_env();
        env.insert("CLEANUP_HOUR_UTC".to_string(), "23".to_string());
        env.insert(
            "TRANSIT_ADDR".to_string(),
            "http://vault:8200".to_string(),
        );
        let config = DataguardConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.cleanup_hour_utc, 23);
        assert_eq!(config.transit_addr.as_deref(), Some("http://vault:8200"));
    }
}
