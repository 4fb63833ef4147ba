//! Server entry decoding and validation.
//!
//! A server list payload holds one entry per line. Each line is the hex
//! encoding of `<ip> <web port> <web secret> <web certificate> <json>`, where
//! the JSON object carries the full entry.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::time::SystemTime;
use tracing::warn;

/// A proxy endpoint record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub ip_address: String,
    #[serde(default)]
    pub web_server_port: String,
    #[serde(default)]
    pub web_server_secret: String,
    #[serde(default)]
    pub web_server_certificate: String,
    /// Where this entry was learned from.
    #[serde(default)]
    pub local_source: String,
    /// RFC 3339 time at which this entry was learned.
    #[serde(default)]
    pub local_timestamp: String,
    /// Remaining fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Current time in the format used for `local_timestamp`.
pub fn current_timestamp() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

/// Decodes one hex-encoded server entry line.
pub fn decode_server_entry(
    encoded: &str,
    timestamp: &str,
    source: &str,
) -> Result<ServerEntry, SyncError> {
    let bytes = hex::decode(encoded.trim())
        .map_err(|e| SyncError::InvalidServerEntry(format!("hex decode failed: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| SyncError::InvalidServerEntry(format!("not UTF-8: {}", e)))?;

    let mut fields = text.splitn(5, ' ');
    let legacy: Vec<&str> = fields.by_ref().take(4).collect();
    let json = fields.next().ok_or_else(|| {
        SyncError::InvalidServerEntry("expected 4 legacy fields followed by JSON".to_string())
    })?;
    if legacy.len() != 4 {
        return Err(SyncError::InvalidServerEntry(
            "missing legacy fields".to_string(),
        ));
    }

    let mut object: Map<String, Value> = serde_json::from_str(json)
        .map_err(|e| SyncError::InvalidServerEntry(format!("invalid JSON: {}", e)))?;

    for (key, value) in [
        "ipAddress",
        "webServerPort",
        "webServerSecret",
        "webServerCertificate",
    ]
    .into_iter()
    .zip(legacy)
    {
        object
            .entry(key)
            .or_insert_with(|| Value::String(value.to_string()));
    }
    object.insert("localSource".to_string(), Value::String(source.to_string()));
    object.insert(
        "localTimestamp".to_string(),
        Value::String(timestamp.to_string()),
    );

    serde_json::from_value(Value::Object(object))
        .map_err(|e| SyncError::InvalidServerEntry(format!("invalid fields: {}", e)))
}

/// Checks the fields an entry needs to be usable.
pub fn validate_server_entry(entry: &ServerEntry) -> Result<(), SyncError> {
    entry.ip_address.parse::<IpAddr>().map_err(|_| {
        SyncError::InvalidServerEntry(format!("invalid IP address: {:?}", entry.ip_address))
    })?;
    Ok(())
}

/// Decodes a whole server list payload.
///
/// Lines that fail to decode fail the whole list. Decoded entries that fail
/// validation are skipped with a warning, so one bad record does not block
/// the rest of the list.
pub fn decode_and_validate_server_entry_list(
    payload: &str,
    timestamp: &str,
    source: &str,
) -> Result<Vec<ServerEntry>, SyncError> {
    let mut entries = Vec::new();
    for line in payload.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let entry = decode_server_entry(line, timestamp, source)?;
        if let Err(e) = validate_server_entry(&entry) {
            warn!("Skipping server entry: {}", e);
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}
