//! Domain data structures for stops, lines, departures, and timetables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Identifier of a single boarding post: stop group plus post number.
///
/// The upstream API calls these `zespol` (group) and `slupek` (post).
pub struct StopId {
    /// Stop group identifier, e.g. `"7009"`.
    pub group: String,
    /// Post number within the group, e.g. `"01"`.
    pub post: String,
}

impl StopId {
    /// Construct a stop id from group and post values.
    #[must_use]
    pub fn new<G: Into<String>, P: Into<String>>(group: G, post: P) -> Self {
        Self {
            group: group.into(),
            post: post.into(),
        }
    }
}

impl fmt::Display for StopId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.group, self.post)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Stop metadata as returned by the stop directory, immutable per snapshot.
pub struct Stop {
    /// Identifier of the boarding post.
    pub id: StopId,
    /// Human-friendly group name, e.g. `"Kijowska"`.
    pub name: String,
    /// Street identifier within the city street register.
    pub street_id: String,
    /// Latitude in WGS84, when the directory provides a parsable value.
    pub lat: Option<f64>,
    /// Longitude in WGS84, when the directory provides a parsable value.
    pub lon: Option<f64>,
    /// Direction label, usually the next stop group on the route.
    pub direction: String,
    /// First day this record is valid for.
    pub valid_from: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Line designation as printed on the vehicle, e.g. `"4"` or `"180"`.
pub struct Line(pub String);

impl Line {
    /// View the designation as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Line {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Vehicle category derived from the line designation.
pub enum VehicleKind {
    /// City bus.
    Bus,
    /// Tram.
    Tram,
    /// Metro line.
    Metro,
    /// WKD commuter rail.
    RegionalRail,
    /// Koleje Mazowieckie rail.
    SuburbanRail,
    /// SKM rapid rail.
    RapidRail,
}

impl VehicleKind {
    /// Classify a line by its designation.
    ///
    /// Ordered lexical rule: a `W`/`R`/`S`/`M` prefix wins outright,
    /// remaining designations of at most two characters are trams,
    /// everything else is a bus.
    #[must_use]
    pub fn of(line: &Line) -> Self {
        match line.as_str().chars().next() {
            Some('W') => Self::RegionalRail,
            Some('R') => Self::SuburbanRail,
            Some('S') => Self::RapidRail,
            Some('M') => Self::Metro,
            _ if line.as_str().chars().count() <= 2 => Self::Tram,
            _ => Self::Bus,
        }
    }
}

impl fmt::Display for VehicleKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Bus => "bus",
            Self::Tram => "tram",
            Self::Metro => "metro",
            Self::RegionalRail => "wkd",
            Self::SuburbanRail => "km",
            Self::RapidRail => "skm",
        };
        write!(formatter, "{label}")
    }
}

#[derive(thiserror::Error, Debug)]
/// A departure time string could not be understood.
#[error("Invalid departure time: {0:?}")]
pub struct ParseTimeError(pub String);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
/// Wall-clock departure time with seconds truncated.
///
/// Hours run past 23 for departures after midnight that still belong to
/// the previous service day, so this is not a [`chrono::NaiveTime`].
pub struct DepartureTime {
    /// Hour of the service day, may exceed 23.
    pub hour: u8,
    /// Minute, 0–59.
    pub minute: u8,
}

impl FromStr for DepartureTime {
    type Err = ParseTimeError;

    /// Parse `HH:MM:SS` or `HH:MM`; the seconds component is dropped.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut fields = raw.split(':');
        let hour = fields.next().and_then(|field| field.parse::<u8>().ok());
        let minute = fields.next().and_then(|field| field.parse::<u8>().ok());

        match (hour, minute) {
            (Some(hour), Some(minute)) if minute < 60 => Ok(Self { hour, minute }),
            _ => Err(ParseTimeError(raw.to_owned())),
        }
    }
}

impl fmt::Display for DepartureTime {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Single scheduled departure of a line from a stop.
pub struct Departure {
    /// Scheduled departure time.
    pub time: DepartureTime,
    /// Brigade identifier (vehicle duty within the line).
    pub brigade: String,
    /// Route variant driven by this trip.
    pub route: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Key grouping departures that belong to the same scheduled trip.
pub struct TripKey(pub String);

impl TripKey {
    /// Build the key from brigade and route variant.
    #[must_use]
    pub fn new(brigade: &str, route: &str) -> Self {
        Self(format!("{brigade}_{route}"))
    }
}

impl fmt::Display for TripKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One (time, stop) observation inside a trip.
pub struct TimetableEntry {
    /// Scheduled departure time at the stop.
    pub time: DepartureTime,
    /// Stop the trip departs from at that time.
    pub stop: StopId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Assembled timetable: line → trip key → time-ordered departures.
pub struct Timetable {
    lines: BTreeMap<Line, BTreeMap<TripKey, Vec<TimetableEntry>>>,
}

impl Timetable {
    /// Create an empty timetable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation to the trip group, in arrival order.
    pub fn push(&mut self, line: Line, key: TripKey, entry: TimetableEntry) {
        self.lines
            .entry(line)
            .or_default()
            .entry(key)
            .or_default()
            .push(entry);
    }

    /// Sort every trip group independently, ascending by departure time.
    ///
    /// The sort is stable, so equal times keep their insertion order.
    pub fn finish(&mut self) {
        for trips in self.lines.values_mut() {
            for entries in trips.values_mut() {
                entries.sort_by_key(|entry| entry.time);
            }
        }
    }

    /// Iterate over all lines and their trip groups.
    pub fn by_line(
        &self,
    ) -> impl Iterator<Item = (&Line, &BTreeMap<TripKey, Vec<TimetableEntry>>)> {
        self.lines.iter()
    }

    /// Trip groups collected for one line, if any.
    #[must_use]
    pub fn trips(&self, line: &Line) -> Option<&BTreeMap<TripKey, Vec<TimetableEntry>>> {
        self.lines.get(line)
    }

    /// Number of lines with at least one collected departure.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Whether no departures were collected at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Which fleet a live position poll tracks.
///
/// The position feed only serves buses and trams; rail and metro
/// vehicles do not report through it.
pub enum TrackedKind {
    /// City buses.
    Buses,
    /// Trams.
    Trams,
}

impl TrackedKind {
    /// File-name prefix for position logs.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Buses => "buses",
            Self::Trams => "trams",
        }
    }
}

impl fmt::Display for TrackedKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.prefix())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// GPS fix reported by one vehicle.
pub struct VehiclePosition {
    /// Line the vehicle is serving.
    pub line: Line,
    /// Brigade identifier within the line.
    pub brigade: String,
    /// Fleet number of the vehicle.
    pub vehicle_number: String,
    /// Latitude in WGS84.
    pub lat: f64,
    /// Longitude in WGS84.
    pub lon: f64,
    /// When the vehicle reported the fix.
    pub recorded_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Result of one full harvest run, written once and never mutated.
pub struct Snapshot {
    /// Day the harvest ran.
    pub collected_on: NaiveDate,
    /// Whether the run was restricted to tram lines.
    pub only_trams: bool,
    /// Stop directory, restricted to stops served by at least one line.
    pub stops: Vec<Stop>,
    /// Lines discovered per stop.
    pub lines_by_stop: BTreeMap<StopId, Vec<Line>>,
    /// The assembled timetable.
    pub timetable: Timetable,
}
