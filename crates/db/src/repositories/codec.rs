//! Shared row-decoding helpers. Timestamps are stored as RFC3339 text and
//! integers come back as i64 from SQLite; everything funnels through here so
//! a bad row produces a decode error naming the column, not a panic.

use chrono::{DateTime, Utc};

use super::RepositoryError;

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_json(column: &str, value: String) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(&value)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}`: {error}")))
}

pub(crate) fn parse_optional_json(
    column: &str,
    value: Option<String>,
) -> Result<Option<serde_json::Value>, RepositoryError> {
    value.map(|raw| parse_json(column, raw)).transpose()
}
