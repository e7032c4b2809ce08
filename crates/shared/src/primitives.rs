use std::{collections::BTreeMap, fmt, str::FromStr};

use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedUuidV4(uuid::Uuid);

impl Default for WrappedUuidV4 {
    fn default() -> Self {
        Self::new()
    }
}

impl WrappedUuidV4 {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl FromStr for WrappedUuidV4 {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl fmt::Display for WrappedUuidV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for WrappedUuidV4 {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(uuid::Uuid::parse_str(&value)?))
    }
}

impl libsql::FromValue for WrappedUuidV4 {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => {
                WrappedUuidV4::try_from(s).map_err(|_e| libsql::Error::InvalidColumnType)
            }
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

impl From<WrappedUuidV4> for libsql::Value {
    fn from(val: WrappedUuidV4) -> Self {
        libsql::Value::Text(val.to_string())
    }
}

pub type LoadSqlMigrationsCallback =
    fn() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>>;

pub trait SqlMigrationLoader {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedJsonValue(serde_json::Value);

impl WrappedJsonValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn get_inner(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for WrappedJsonValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<WrappedJsonValue> for serde_json::Value {
    fn from(value: WrappedJsonValue) -> Self {
        value.0
    }
}

impl From<WrappedJsonValue> for libsql::Value {
    fn from(value: WrappedJsonValue) -> Self {
        libsql::Value::Text(value.0.to_string())
    }
}

impl libsql::FromValue for WrappedJsonValue {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => Ok(WrappedJsonValue::new(
                serde_json::from_str(&s).map_err(|_e| libsql::Error::InvalidColumnType)?,
            )),
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

/// Datetime format SQLite emits for `datetime('now')` columns.
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

fn parse_datetime(value: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    // Try SQLite datetime format first, then fall back to RFC3339
    chrono::NaiveDateTime::parse_from_str(value, SQLITE_DATETIME_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(value).map(|dt| dt.into()))
        .map_err(|_e| anyhow::anyhow!("invalid datetime value: {value}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedChronoDateTime(chrono::DateTime<chrono::Utc>);

impl WrappedChronoDateTime {
    pub fn new(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    pub fn get_inner(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }
}

impl TryFrom<&str> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(WrappedChronoDateTime::new(parse_datetime(value)?))
    }
}

impl TryFrom<String> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        WrappedChronoDateTime::try_from(value.as_str())
    }
}

impl fmt::Display for WrappedChronoDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for WrappedChronoDateTime {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }
}

impl From<WrappedChronoDateTime> for chrono::DateTime<chrono::Utc> {
    fn from(value: WrappedChronoDateTime) -> Self {
        value.0
    }
}

impl libsql::FromValue for WrappedChronoDateTime {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => parse_datetime(&s)
                .map(WrappedChronoDateTime::new)
                .map_err(|_e| libsql::Error::InvalidColumnType),
            libsql::Value::Null => Err(libsql::Error::NullValue),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

impl From<WrappedChronoDateTime> for libsql::Value {
    fn from(value: WrappedChronoDateTime) -> Self {
        // Stored in SQLite's expected datetime format instead of RFC3339 so
        // that lexicographic comparison in SQL matches chronological order
        libsql::Value::Text(value.0.format(SQLITE_DATETIME_FORMAT).to_string())
    }
}

// Pagination types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationRequest {
    pub page_size: i64,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T: Serialize> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Decode a base64-encoded pagination token back to a vector of strings
pub fn decode_pagination_token(token: &str) -> anyhow::Result<Vec<String>> {
    let decoded_bytes = base64::engine::general_purpose::STANDARD.decode(token)?;
    let decoded_str = String::from_utf8(decoded_bytes)?;
    Ok(decoded_str.split("__").map(|s| s.to_string()).collect())
}

impl<T: Serialize> PaginatedResponse<T> {
    /// Create a paginated response from a list of items fetched with `page_size + 1`.
    ///
    /// Expects that the caller fetched `page_size + 1` items from the database,
    /// drops the extra item if present, and derives the next page token from the
    /// composite key of the last retained item.
    pub fn from_items_with_extra<F>(
        mut items: Vec<T>,
        pagination: &PaginationRequest,
        get_id: F,
    ) -> Self
    where
        F: FnOnce(&T) -> Vec<String>,
    {
        let has_more = items.len() as i64 > pagination.page_size;
        if has_more {
            items.pop();
        }

        let next_page_token = if has_more && !items.is_empty() {
            items.last().map(|item| {
                let composite_key = get_id(item).join("__");
                base64::engine::general_purpose::STANDARD.encode(composite_key.as_bytes())
            })
        } else {
            None
        };

        Self {
            items,
            next_page_token,
        }
    }
}
