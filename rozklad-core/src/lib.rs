//! Core types and pipeline wiring for the rozklad timetable harvester.

/// Domain models for stops, lines, departures, and assembled timetables.
pub mod model;
/// The three-stage harvest pipeline.
pub mod pipeline;
/// Traits describing the transit API and operator notification interfaces.
pub mod ports;
/// Compressed, date-stamped snapshot files.
pub mod snapshot;

pub use model::*;
pub use pipeline::*;
pub use ports::*;
pub use snapshot::*;
