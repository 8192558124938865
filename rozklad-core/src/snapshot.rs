//! Writing and reading the on-disk artifacts of a collection run.
//!
//! A timetable snapshot is MessagePack inside gzip, named
//! `rozklady_YYYY-MM-DD.bin.gz` after the day the harvest ran. Position
//! samples are appended as JSON lines into hourly files grouped by
//! month directories.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::model::{Snapshot, TrackedKind, VehiclePosition};

#[derive(thiserror::Error, Debug)]
/// Errors while persisting or loading a snapshot.
pub enum SnapshotError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The in-memory table could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// The file contents could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A position sample could not be encoded.
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// File name for a snapshot collected on the given day.
#[must_use]
pub fn snapshot_file_name(collected_on: NaiveDate) -> String {
    format!("rozklady_{collected_on}.bin.gz")
}

/// Serialize the snapshot into `dir` and return the written path.
///
/// # Errors
///
/// Returns a [`SnapshotError`] when the file cannot be created or the
/// table cannot be encoded. Callers treat this as non-fatal: the data
/// gathering already finished by the time the write happens.
pub fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
    let path = dir.join(snapshot_file_name(snapshot.collected_on));
    let file = File::create(&path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    rmp_serde::encode::write_named(&mut encoder, snapshot)?;
    encoder.finish()?;
    Ok(path)
}

/// Load a snapshot previously written by [`write_snapshot`].
///
/// # Errors
///
/// Returns a [`SnapshotError`] when the file cannot be opened or does not
/// decode as a snapshot.
pub fn read_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    Ok(rmp_serde::decode::from_read(decoder)?)
}

/// Append one polling sample to the hour's position log.
///
/// Samples land under `base` in a `MONTH_YEAR` directory, one JSON line
/// per vehicle, in a file named `{kind}_{year}_{month}_{day}_{hour}.jsonl`.
/// The hourly file and the month directory roll over on their own as the
/// sample timestamps advance.
///
/// # Errors
///
/// Returns a [`SnapshotError`] when the directory or file cannot be
/// written or a fix cannot be encoded. Callers treat a failed append as
/// a lost sample, not a failed run.
pub fn append_positions(
    base: &Path,
    kind: TrackedKind,
    stamped: NaiveDateTime,
    positions: &[VehiclePosition],
) -> Result<PathBuf, SnapshotError> {
    let dir = base.join(format!("{}_{}", stamped.month(), stamped.year()));
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!(
        "{}_{}_{}_{}_{}.jsonl",
        kind.prefix(),
        stamped.year(),
        stamped.month(),
        stamped.day(),
        stamped.hour()
    ));

    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut writer = BufWriter::new(file);
    for position in positions {
        serde_json::to_writer(&mut writer, position)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use crate::model::{
        Line, Snapshot, Stop, StopId, Timetable, TimetableEntry, TrackedKind, TripKey,
        VehiclePosition,
    };

    use super::{append_positions, read_snapshot, snapshot_file_name, write_snapshot};

    #[test]
    fn file_name_carries_the_collection_date() {
        let day = NaiveDate::from_ymd_opt(2023, 1, 13).expect("valid date");
        assert_eq!(snapshot_file_name(day), "rozklady_2023-01-13.bin.gz");
    }

    #[test]
    fn written_snapshot_reads_back() {
        let stop_id = StopId::new("7009", "01");
        let line = Line("4".to_owned());

        let mut timetable = Timetable::new();
        timetable.push(
            line.clone(),
            TripKey::new("1", "TP-A"),
            TimetableEntry {
                time: "10:00:00".parse().expect("test time should parse"),
                stop: stop_id.clone(),
            },
        );
        timetable.finish();

        let mut lines_by_stop = BTreeMap::new();
        lines_by_stop.insert(stop_id.clone(), vec![line.clone()]);

        let snapshot = Snapshot {
            collected_on: NaiveDate::from_ymd_opt(2023, 1, 13).expect("valid date"),
            only_trams: true,
            stops: vec![Stop {
                id: stop_id,
                name: "Kijowska".to_owned(),
                street_id: "2201".to_owned(),
                lat: Some(52.248_455),
                lon: Some(21.044_827),
                direction: "al.Zieleniecka".to_owned(),
                valid_from: None,
            }],
            lines_by_stop,
            timetable,
        };

        let dir = std::env::temp_dir();
        let path = write_snapshot(&dir, &snapshot).expect("write succeeds");
        let restored = read_snapshot(&path).expect("read succeeds");

        assert_eq!(restored.collected_on, snapshot.collected_on);
        assert!(restored.only_trams);
        assert_eq!(restored.stops.len(), 1);
        assert_eq!(restored.timetable.line_count(), 1);
        let trips = restored.timetable.trips(&line).expect("line survives");
        assert_eq!(trips.len(), 1);

        std::fs::remove_file(path).ok();
    }

    fn fix(line: &str, vehicle_number: &str) -> VehiclePosition {
        VehiclePosition {
            line: Line(line.to_owned()),
            brigade: "2".to_owned(),
            vehicle_number: vehicle_number.to_owned(),
            lat: 52.233,
            lon: 21.015,
            recorded_at: NaiveDate::from_ymd_opt(2023, 1, 13)
                .expect("valid date")
                .and_hms_opt(12, 30, 45)
                .expect("valid time"),
        }
    }

    #[test]
    fn position_samples_append_into_the_hourly_file() {
        let base = std::env::temp_dir().join("rozklad-positions-test");
        std::fs::remove_dir_all(&base).ok();

        let stamped = NaiveDate::from_ymd_opt(2023, 1, 13)
            .expect("valid date")
            .and_hms_opt(12, 30, 45)
            .expect("valid time");

        let first = append_positions(
            &base,
            TrackedKind::Trams,
            stamped,
            &[fix("33", "1000"), fix("17", "1001")],
        )
        .expect("first sample appends");
        let second = append_positions(&base, TrackedKind::Trams, stamped, &[fix("33", "1000")])
            .expect("second sample appends");

        assert_eq!(first, second, "same hour lands in the same file");
        assert!(first.ends_with("1_2023/trams_2023_1_13_12.jsonl"));

        let contents = std::fs::read_to_string(&first).expect("log is readable");
        let fixes: Vec<VehiclePosition> = contents
            .lines()
            .map(|sample| serde_json::from_str(sample).expect("sample line decodes"))
            .collect();
        assert_eq!(fixes.len(), 3);
        assert_eq!(
            fixes.first().map(|decoded| decoded.line.clone()),
            Some(Line("33".to_owned()))
        );

        std::fs::remove_dir_all(&base).ok();
    }
}
