//! Client for the UM Warszawa open data API (api.um.warszawa.pl).
//!
//! Every endpoint answers with the same envelope,
//! `{"result": [{"values": [{"key": ..., "value": ...}, ...]}, ...]}`,
//! and signals caller mistakes by putting an error *string* where the
//! record list should be. The client turns that envelope into the core
//! domain types and hides the bounded retry behind one fetch path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use rozklad_core::{
    model::{Departure, Line, Stop, StopId, TrackedKind, VehiclePosition},
    ports::{ApiError, PositionApi, TransitApi},
};

const BASE_URL: &str = "https://api.um.warszawa.pl/api/action";

/// `dbstore_get` resource holding the current day's stop directory.
const STOPS_RESOURCE: &str = "1c08a38c-ae09-46d2-8926-4f9d25cb0630";
/// `dbtimetable_get` resource listing lines at a boarding post.
const LINES_RESOURCE: &str = "88cd555f-6f31-43ca-9de4-66c479ad5942";
/// `dbtimetable_get` resource with the departures of one line at one post.
const TIMETABLE_RESOURCE: &str = "e923fa0e-d96c-43f9-ae6e-60518c9f3238";
/// `busestrams_get` resource with the live vehicle positions.
const POSITIONS_RESOURCE: &str = "f2e5503e-927d-4ad3-9500-4ab9e55deb59";

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPT_BUDGET: u32 = 5;

// `obowiazuje_od` comes back as e.g. "2023-01-13 00:00:00.0"
const VALID_FROM_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
// `Time` on position fixes comes back as e.g. "2023-01-13 12:30:45"
const POSITION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(thiserror::Error, Debug)]
/// Errors while loading the API key file.
pub enum CredentialsError {
    /// The credentials file does not exist.
    #[error("No credentials file at {0}")]
    Missing(PathBuf),
    /// The file exists but could not be read.
    #[error("Failed to read credentials: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not the expected JSON document.
    #[error("Failed to parse credentials: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
/// API key for api.um.warszawa.pl, loaded from a local JSON file.
pub struct Credentials {
    /// The key itself, as issued after registering an account.
    #[serde(rename = "API_KEY")]
    pub api_key: String,
}

impl Credentials {
    /// Load credentials from a `{"API_KEY": "..."}` file.
    ///
    /// A missing file is a fatal startup condition for the harvester, so
    /// it gets its own variant instead of being folded into I/O errors.
    ///
    /// # Errors
    ///
    /// Returns a [`CredentialsError`] when the file is absent, unreadable,
    /// or not the expected document.
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        if !path.exists() {
            return Err(CredentialsError::Missing(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Envelope every endpoint wraps its payload in.
#[derive(Debug, Deserialize)]
struct Envelope {
    result: Option<Value>,
}

/// Record made of key/value pairs, the only record shape the API emits.
#[derive(Debug, Clone, Deserialize)]
struct KvRecord {
    values: Vec<KvPair>,
}

#[derive(Debug, Clone, Deserialize)]
struct KvPair {
    key: String,
    value: String,
}

/// Vehicle fix from the `busestrams_get` feed.
///
/// Unlike the timetable resources this one answers with plain objects,
/// not key/value pair records.
#[derive(Debug, Clone, Deserialize)]
struct PositionRecord {
    #[serde(rename = "Lines")]
    lines: String,
    #[serde(rename = "Brigade")]
    brigade: String,
    #[serde(rename = "VehicleNumber")]
    vehicle_number: String,
    #[serde(rename = "Lat")]
    lat: f64,
    #[serde(rename = "Lon")]
    lon: f64,
    #[serde(rename = "Time")]
    time: String,
}

/// HTTP client for the UM Warszawa API implementing [`TransitApi`].
pub struct WarsawApi {
    client: Client,
    api_key: String,
    base_url: String,
    attempts: u32,
}

impl WarsawApi {
    /// Build a client with the default endpoint, timeout, and retry budget.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(credentials: Credentials) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .user_agent("rozklad/0.1")
            .build()?;

        Ok(Self {
            client,
            api_key: credentials.api_key,
            base_url: BASE_URL.to_owned(),
            attempts: ATTEMPT_BUDGET,
        })
    }

    /// Point the client at a different base URL (local test servers).
    #[must_use]
    pub fn with_base_url<U: Into<String>>(mut self, base_url: U) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch one endpoint with the bounded retry policy.
    ///
    /// Transient failures are logged and retried until the attempt budget
    /// runs out; schema-class failures abort immediately.
    async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, ApiError> {
        let url = format!("{}/{}/", self.base_url, endpoint);

        for attempt in 1..=self.attempts {
            match self.attempt(&url, params).await {
                Ok(records) => return Ok(records),
                Err(error) if error.is_transient() => {
                    tracing::warn!(attempt, %error, %url, "Transient fetch failure");
                }
                Err(error) => return Err(error),
            }
        }

        Err(ApiError::RetriesExhausted {
            attempts: self.attempts,
        })
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, ApiError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        parse_result(&body)
    }
}

#[async_trait]
impl TransitApi for WarsawApi {
    async fn stops(&self) -> Result<Vec<Stop>, ApiError> {
        let records: Vec<KvRecord> =
            self.fetch("dbstore_get", &[("id", STOPS_RESOURCE)]).await?;
        let rows = flatten_records(&records)?;
        rows.iter().map(stop_from_row).collect()
    }

    async fn lines_at(&self, stop: &StopId) -> Result<Vec<Line>, ApiError> {
        let records: Vec<KvRecord> = self
            .fetch(
                "dbtimetable_get",
                &[
                    ("id", LINES_RESOURCE),
                    ("busstopId", &stop.group),
                    ("busstopNr", &stop.post),
                ],
            )
            .await?;

        records
            .iter()
            .map(|record| kv_value(record, "linia").map(|name| Line(name.to_owned())))
            .collect()
    }

    async fn departures(&self, stop: &StopId, line: &Line) -> Result<Vec<Departure>, ApiError> {
        let records: Vec<KvRecord> = self
            .fetch(
                "dbtimetable_get",
                &[
                    ("id", TIMETABLE_RESOURCE),
                    ("busstopId", &stop.group),
                    ("busstopNr", &stop.post),
                    ("line", line.as_str()),
                ],
            )
            .await?;

        records.iter().map(departure_from_record).collect()
    }
}

#[async_trait]
impl PositionApi for WarsawApi {
    async fn positions(&self, kind: TrackedKind) -> Result<Vec<VehiclePosition>, ApiError> {
        let code = match kind {
            TrackedKind::Buses => "1",
            TrackedKind::Trams => "2",
        };

        let records: Vec<PositionRecord> = self
            .fetch(
                "busestrams_get",
                &[("resource_id", POSITIONS_RESOURCE), ("type", code)],
            )
            .await?;

        records.into_iter().map(position_from_record).collect()
    }
}

/// Decode an endpoint body into its record list.
///
/// The API never uses HTTP status codes for caller mistakes: a bad key or
/// bad parameters come back as 200 with a string in `result`.
fn parse_result<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::EmptyBody);
    }

    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|error| ApiError::MalformedResult(error.to_string()))?;

    match envelope.result {
        None => Err(ApiError::MissingResult),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|error| ApiError::MalformedResult(error.to_string()))
            })
            .collect(),
        Some(other) => Err(ApiError::MalformedResult(preview(&other))),
    }
}

/// Short rendering of an unexpected `result` value for the error message.
fn preview(value: &Value) -> String {
    value.to_string().chars().take(120).collect()
}

/// Look up one key in a key/value record.
fn kv_value<'record>(record: &'record KvRecord, key: &'static str) -> Result<&'record str, ApiError> {
    record
        .values
        .iter()
        .find(|pair| pair.key == key)
        .map(|pair| pair.value.as_str())
        .ok_or(ApiError::MissingField(key))
}

/// Flatten key/value records into named rows.
///
/// The key set of the first record defines the schema and every later
/// record must match it exactly; a divergence means the upstream resource
/// changed shape mid-list and the run must not continue on garbage.
fn flatten_records(records: &[KvRecord]) -> Result<Vec<BTreeMap<String, String>>, ApiError> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };

    let schema: Vec<&str> = first.values.iter().map(|pair| pair.key.as_str()).collect();

    let mut rows = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let mut row = BTreeMap::new();
        for pair in &record.values {
            if !schema.contains(&pair.key.as_str()) {
                return Err(ApiError::Schema(format!(
                    "record {index} has unexpected key '{}'",
                    pair.key
                )));
            }
            row.insert(pair.key.clone(), pair.value.clone());
        }
        if row.len() != schema.len() {
            let missing = schema
                .iter()
                .find(|key| !row.contains_key(**key))
                .copied()
                .unwrap_or("?");
            return Err(ApiError::Schema(format!(
                "record {index} is missing key '{missing}'"
            )));
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Build a [`Stop`] from a flattened directory row.
fn stop_from_row(row: &BTreeMap<String, String>) -> Result<Stop, ApiError> {
    let field = |key: &'static str| -> Result<&String, ApiError> {
        row.get(key).ok_or(ApiError::MissingField(key))
    };

    Ok(Stop {
        id: StopId::new(field("zespol")?.clone(), field("slupek")?.clone()),
        name: field("nazwa_zespolu")?.clone(),
        street_id: field("id_ulicy")?.clone(),
        lat: field("szer_geo")?.parse().ok(),
        lon: field("dlug_geo")?.parse().ok(),
        direction: field("kierunek")?.clone(),
        valid_from: parse_valid_from(field("obowiazuje_od")?),
    })
}

/// The directory occasionally carries the literal string "null" here, so
/// an unparsable date is simply absent.
fn parse_valid_from(raw: &str) -> Option<NaiveDate> {
    NaiveDateTime::parse_from_str(raw, VALID_FROM_FORMAT)
        .map(|stamp| stamp.date())
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// Build a [`Departure`] from a timetable record.
///
/// The record also carries `symbol_1`, `symbol_2`, and `kierunek`, which
/// the harvest does not use.
fn departure_from_record(record: &KvRecord) -> Result<Departure, ApiError> {
    let time = kv_value(record, "czas")?.parse()?;

    Ok(Departure {
        time,
        brigade: kv_value(record, "brygada")?.to_owned(),
        route: kv_value(record, "trasa")?.to_owned(),
    })
}

/// Build a [`VehiclePosition`] from a feed record.
fn position_from_record(record: PositionRecord) -> Result<VehiclePosition, ApiError> {
    let recorded_at = NaiveDateTime::parse_from_str(&record.time, POSITION_TIME_FORMAT)
        .map_err(|_parse| ApiError::BadTimestamp(record.time.clone()))?;

    Ok(VehiclePosition {
        line: Line(record.lines),
        brigade: record.brigade,
        vehicle_number: record.vehicle_number,
        lat: record.lat,
        lon: record.lon,
        recorded_at,
    })
}
