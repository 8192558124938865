//! Traits describing the upstream transit API and shared error types.

use async_trait::async_trait;
use reqwest::Error as ReqwestError;

use crate::model::{
    Departure, Line, ParseTimeError, Stop, StopId, TrackedKind, VehiclePosition,
};

#[derive(thiserror::Error, Debug)]
/// Errors that can occur while talking to the transit API.
pub enum ApiError {
    /// Network layer failed (connection reset, DNS, per-attempt timeout).
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    /// Every attempt of the retry budget failed with a transient error.
    #[error("Request failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// Response body was empty where a JSON document was expected.
    #[error("Empty response body")]
    EmptyBody,
    /// The response document has no `result` key.
    #[error("Response has no 'result' key")]
    MissingResult,
    /// The `result` value is not a list, typically an error string
    /// such as `"Błędna metoda lub parametry wywołania"`.
    #[error("Malformed 'result' value: {0}")]
    MalformedResult(String),
    /// A record's key set differs from the schema set by the first record.
    #[error("Inconsistent record schema: {0}")]
    Schema(String),
    /// A record lacks a field the caller needs.
    #[error("Record is missing the '{0}' field")]
    MissingField(&'static str),
    /// A departure time could not be parsed.
    #[error(transparent)]
    Time(#[from] ParseTimeError),
    /// A position timestamp could not be parsed.
    #[error("Invalid timestamp: {0:?}")]
    BadTimestamp(String),
}

impl ApiError {
    /// Whether retrying the same request can reasonably succeed.
    ///
    /// Schema-class failures are terminal: the server answered, the
    /// answer just does not have the promised shape. An exhausted retry
    /// budget is terminal too — retrying is exactly what just failed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::EmptyBody)
    }
}

#[async_trait]
/// Read-only view of the transit authority's REST API.
pub trait TransitApi: Send + Sync {
    /// Fetch the full stop directory for the current day.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the request fails or the stop
    /// records do not share a uniform schema.
    async fn stops(&self) -> Result<Vec<Stop>, ApiError>;

    /// List the lines serving one boarding post.
    ///
    /// An empty list is a valid answer, not an error.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the request fails.
    async fn lines_at(&self, stop: &StopId) -> Result<Vec<Line>, ApiError>;

    /// Fetch the scheduled departures of one line from one post.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the request fails or a record is
    /// missing the brigade, route, or time field.
    async fn departures(&self, stop: &StopId, line: &Line) -> Result<Vec<Departure>, ApiError>;
}

#[async_trait]
/// Live vehicle position feed.
///
/// Separate from [`TransitApi`]: position polling is its own collection
/// mode with its own cadence and output, and a backend may well offer
/// one feed without the other.
pub trait PositionApi: Send + Sync {
    /// Fetch the current GPS fixes for the tracked fleet.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the request fails or a fix carries
    /// an unparsable timestamp.
    async fn positions(&self, kind: TrackedKind) -> Result<Vec<VehiclePosition>, ApiError>;
}

#[async_trait]
/// Side channel for telling an operator that a run died.
///
/// The reference deployment mailed the operator; anything that can carry
/// a subject and a body fits behind this trait.
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Delivery failures are the implementation's
    /// problem; the pipeline has already failed when this is called.
    async fn notify(&self, subject: &str, body: &str);
}
