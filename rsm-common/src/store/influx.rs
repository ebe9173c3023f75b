//! InfluxDB 1.x client
//!
//! Writes use the line protocol on `POST /write?precision=s`; reads use
//! InfluxQL on `GET /query?epoch=s`, so every timestamp crossing the wire is
//! whole seconds since the epoch.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{StoredKey, TimeSeriesStore};
use crate::config::Config;
use crate::payload::{RecordKey, StoredRecord};
use crate::{Error, Result};

const USER_AGENT: &str = concat!("rsm/", env!("CARGO_PKG_VERSION"));

/// Columns selected by record queries, in this order
const COLUMNS: [&str; 5] = [
    "air_temperature",
    "humidity",
    "filename",
    "audio_base64",
    "device",
];

/// Columns selected by key queries
const KEY_COLUMNS: [&str; 2] = ["filename", "device"];

pub struct InfluxStore {
    http_client: reqwest::Client,
    base_url: String,
    database: String,
    measurement: String,
    username: String,
    password: Option<String>,
}

impl InfluxStore {
    /// Create a client from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.store.request_timeout_secs))
            .build()
            .map_err(|e| Error::Storage(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.store.url.trim_end_matches('/').to_string(),
            database: config.store_database(),
            measurement: config.store.measurement.clone(),
            username: config.store_username(),
            password: config.store.password.clone(),
        })
    }

    /// Confirm the server answers and the database is queryable
    ///
    /// Called once at startup; a failure there aborts the service.
    pub async fn check_connection(&self) -> Result<()> {
        let response = self
            .http_client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("store unreachable at {}: {}", self.base_url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "store ping returned HTTP {}",
                response.status().as_u16()
            )));
        }
        self.run_query(&format!(
            "SHOW MEASUREMENTS ON {}",
            quote_identifier(&self.database)
        ))
        .await
        .map(|_| ())
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.password {
            Some(password) => request.basic_auth(&self.username, Some(password)),
            None => request,
        }
    }

    async fn run_query(&self, query: &str) -> Result<InfluxResponse> {
        debug!(query = %query, "InfluxDB query");
        let request = self
            .http_client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("db", self.database.as_str()),
                ("q", query),
                ("epoch", "s"),
            ]);
        let response = self
            .with_auth(request)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("query request failed: {}", e)))?;

        let status = response.status();
        let body: InfluxResponse = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("unreadable query response (HTTP {}): {}", status.as_u16(), e)))?;

        if let Some(error) = body.first_error() {
            return Err(Error::Storage(format!("query rejected: {}", error)));
        }
        if !status.is_success() {
            return Err(Error::Storage(format!("query returned HTTP {}", status.as_u16())));
        }
        Ok(body)
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write(&self, record: &StoredRecord) -> Result<()> {
        let line = line_protocol(&self.measurement, record)?;
        let request = self
            .http_client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", "s")])
            .body(line);
        let response = self
            .with_auth(request)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("write request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Storage(format!(
                "write returned HTTP {}: {}",
                status.as_u16(),
                error_text.trim()
            )));
        }
        Ok(())
    }

    async fn query_from(&self, from: DateTime<Utc>, limit: usize) -> Result<Vec<StoredRecord>> {
        let query = select_from(&self.measurement, &COLUMNS, from, limit);
        let response = self.run_query(&query).await?;
        Ok(response.into_records())
    }

    async fn keys_from(&self, from: DateTime<Utc>, limit: usize) -> Result<Vec<StoredKey>> {
        let query = select_from(&self.measurement, &KEY_COLUMNS, from, limit);
        let response = self.run_query(&query).await?;
        Ok(response.into_keys())
    }
}

/// InfluxQL for the earliest `limit` points at or after `from`
fn select_from(measurement: &str, columns: &[&str], from: DateTime<Utc>, limit: usize) -> String {
    let columns: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    format!(
        "SELECT {} FROM {} WHERE time >= '{}' ORDER BY time ASC LIMIT {}",
        columns.join(","),
        quote_identifier(measurement),
        from.to_rfc3339_opts(SecondsFormat::Secs, true),
        limit.max(1)
    )
}

/// Render one record as an InfluxDB line
pub fn line_protocol(measurement: &str, record: &StoredRecord) -> Result<String> {
    if !record.air_temperature.is_finite() || !record.humidity.is_finite() {
        return Err(Error::Storage(format!(
            "non-finite reading for {} ({}, {})",
            record.filename, record.air_temperature, record.humidity
        )));
    }

    let mut line = escape_key(measurement);
    if let Some(device) = &record.device {
        line.push_str(",device=");
        line.push_str(&escape_key(device));
    }
    line.push_str(&format!(
        " air_temperature={},humidity={},filename=\"{}\",audio_base64=\"{}\" {}",
        record.air_temperature,
        record.humidity,
        escape_string(&record.filename),
        escape_string(&record.audio_base64),
        record.time.timestamp()
    ));
    Ok(line)
}

/// Escape a measurement name or tag value
fn escape_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a string field value
fn escape_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn quote_identifier(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\\\""))
}

#[derive(Debug, Deserialize)]
struct InfluxResponse {
    #[serde(default)]
    results: Vec<InfluxResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxResult {
    #[serde(default)]
    series: Vec<InfluxSeries>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxSeries {
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl InfluxResponse {
    fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.results.iter().find_map(|r| r.error.as_deref()))
    }

    fn into_records(self) -> Vec<StoredRecord> {
        let mut records = Vec::new();
        for series in self.results.into_iter().flat_map(|r| r.series) {
            for row in &series.values {
                match record_from_row(&series.columns, row) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping unusable stored point: {}", e),
                }
            }
        }
        records
    }

    fn into_keys(self) -> Vec<StoredKey> {
        let mut keys = Vec::new();
        for series in self.results.into_iter().flat_map(|r| r.series) {
            for row in &series.values {
                match key_from_row(&series.columns, row) {
                    Ok(key) => keys.push(key),
                    Err(e) => warn!("Skipping unusable stored point: {}", e),
                }
            }
        }
        keys
    }
}

fn cell<'a>(columns: &[String], row: &'a [Value], name: &str) -> Option<&'a Value> {
    columns
        .iter()
        .position(|c| c == name)
        .and_then(|i| row.get(i))
        .filter(|v| !v.is_null())
}

fn text(columns: &[String], row: &[Value], name: &str) -> Result<String> {
    cell(columns, row, name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Storage(format!("point has no '{}'", name)))
}

fn time_of(columns: &[String], row: &[Value]) -> Result<DateTime<Utc>> {
    let secs = cell(columns, row, "time")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Storage("point has no integer time".to_string()))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::Storage(format!("time {} out of range", secs)))
}

fn key_from_row(columns: &[String], row: &[Value]) -> Result<StoredKey> {
    Ok(StoredKey {
        time: time_of(columns, row)?,
        key: RecordKey {
            device: text(columns, row, "device").ok(),
            filename: text(columns, row, "filename")?,
        },
    })
}

fn record_from_row(columns: &[String], row: &[Value]) -> Result<StoredRecord> {
    let number = |name: &str| -> f64 {
        cell(columns, row, name)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };

    Ok(StoredRecord {
        time: time_of(columns, row)?,
        air_temperature: number("air_temperature"),
        humidity: number("humidity"),
        filename: text(columns, row, "filename")?,
        audio_base64: text(columns, row, "audio_base64")?,
        device: text(columns, row, "device").ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_timestamp;
    use serde_json::json;

    fn record() -> StoredRecord {
        StoredRecord {
            time: parse_timestamp("2025-03-01T12:00:05Z").unwrap(),
            air_temperature: 22.5,
            humidity: 45.0,
            filename: "recording_2025-03-01_12-00-01.wav".to_string(),
            audio_base64: "UklGRg==".to_string(),
            device: Some("living room".to_string()),
        }
    }

    #[test]
    fn test_line_protocol_layout() {
        let line = line_protocol("room_sensors_raw", &record()).unwrap();
        assert_eq!(
            line,
            "room_sensors_raw,device=living\\ room air_temperature=22.5,humidity=45,\
             filename=\"recording_2025-03-01_12-00-01.wav\",audio_base64=\"UklGRg==\" 1740830405"
        );
    }

    #[test]
    fn test_line_protocol_without_device_has_no_tag() {
        let mut r = record();
        r.device = None;
        let line = line_protocol("room_sensors_raw", &r).unwrap();
        assert!(line.starts_with("room_sensors_raw air_temperature="));
    }

    #[test]
    fn test_line_protocol_escapes_quotes_in_strings() {
        let mut r = record();
        r.filename = "a\"b.wav".to_string();
        let line = line_protocol("m", &r).unwrap();
        assert!(line.contains("filename=\"a\\\"b.wav\""));
    }

    #[test]
    fn test_line_protocol_rejects_non_finite() {
        let mut r = record();
        r.humidity = f64::NAN;
        assert!(matches!(line_protocol("m", &r), Err(Error::Storage(_))));
    }

    #[test]
    fn test_query_response_to_records() {
        let body: InfluxResponse = serde_json::from_value(json!({
            "results": [{
                "statement_id": 0,
                "series": [{
                    "name": "room_sensors_raw",
                    "columns": ["time", "air_temperature", "humidity", "filename", "audio_base64", "device"],
                    "values": [
                        [1740830405, 22.5, 45, "a.wav", "UklGRg==", "kitchen"],
                        [1740830425, 23.0, 44.5, "b.wav", "UklGRg==", null],
                        [1740830445, 23.0, 44.5, null, "UklGRg==", null]
                    ]
                }]
            }]
        }))
        .unwrap();
        assert!(body.first_error().is_none());
        let records = body.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record_with("a.wav", Some("kitchen")));
        assert_eq!(records[1].device, None);
        assert_eq!(records[1].humidity, 44.5);
    }

    fn record_with(filename: &str, device: Option<&str>) -> StoredRecord {
        StoredRecord {
            filename: filename.to_string(),
            device: device.map(str::to_string),
            ..record()
        }
    }

    #[test]
    fn test_select_is_bounded_and_ascending() {
        let from = parse_timestamp("2025-03-01T12:00:05Z").unwrap();
        assert_eq!(
            select_from("room_sensors_raw", &KEY_COLUMNS, from, 25),
            "SELECT \"filename\",\"device\" FROM \"room_sensors_raw\" \
             WHERE time >= '2025-03-01T12:00:05Z' ORDER BY time ASC LIMIT 25"
        );
        assert!(select_from("m", &COLUMNS, from, 0).ends_with("LIMIT 1"));
    }

    #[test]
    fn test_key_response_has_no_audio() {
        let body: InfluxResponse = serde_json::from_value(json!({
            "results": [{
                "statement_id": 0,
                "series": [{
                    "name": "room_sensors_raw",
                    "columns": ["time", "filename", "device"],
                    "values": [
                        [1740830405, "a.wav", "kitchen"],
                        [1740830425, "b.wav", null]
                    ]
                }]
            }]
        }))
        .unwrap();
        let keys = body.into_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].time, record().time);
        assert_eq!(keys[0].key.device.as_deref(), Some("kitchen"));
        assert_eq!(keys[1].key.filename, "b.wav");
        assert_eq!(keys[1].key.device, None);
    }

    #[test]
    fn test_empty_result_has_no_records() {
        let body: InfluxResponse =
            serde_json::from_value(json!({"results": [{"statement_id": 0}]})).unwrap();
        assert!(body.into_records().is_empty());
    }

    #[test]
    fn test_statement_error_is_reported() {
        let body: InfluxResponse = serde_json::from_value(json!({
            "results": [{"statement_id": 0, "error": "database not found: team14_db"}]
        }))
        .unwrap();
        assert_eq!(body.first_error(), Some("database not found: team14_db"));
    }

    #[test]
    fn test_client_creation() {
        assert!(InfluxStore::new(&Config::default()).is_ok());
    }
}
