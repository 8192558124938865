//! The three-stage harvest pipeline: stop directory, line discovery,
//! timetable collection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::model::{
    Line, Snapshot, Stop, StopId, Timetable, TimetableEntry, TripKey, VehicleKind,
};
use crate::ports::{ApiError, TransitApi};

#[derive(Debug, Clone, Copy, Default)]
/// Knobs for a harvest run.
pub struct HarvestOptions {
    /// Collect timetables for tram lines only.
    pub only_trams: bool,
}

/// Drives the sequential harvest against a [`TransitApi`].
///
/// The pipeline owns nothing shared; every run rebuilds the full table
/// from scratch and hands it back as a [`Snapshot`].
pub struct Harvester {
    api: Arc<dyn TransitApi>,
    options: HarvestOptions,
}

impl Harvester {
    /// Create a harvester bound to the given API client.
    #[must_use]
    pub fn new(api: Arc<dyn TransitApi>, options: HarvestOptions) -> Self {
        Self { api, options }
    }

    /// Run the full pipeline and assemble a snapshot for `collected_on`.
    ///
    /// A degraded result (every line filtered out) is still a success;
    /// the caller decides what to do with an empty table.
    ///
    /// # Errors
    ///
    /// Returns the first [`ApiError`] any stage runs into. By the time an
    /// error surfaces here the client has already spent its retry budget,
    /// so every error is terminal for the run.
    pub async fn run(&self, collected_on: NaiveDate) -> Result<Snapshot, ApiError> {
        tracing::info!("Fetching stop directory");
        let stops = self.api.stops().await?;
        tracing::info!(stops = stops.len(), "Stop directory loaded");

        tracing::info!("Discovering lines per stop");
        let (stops, lines_by_stop) = self.discover_lines(stops).await?;
        tracing::info!(active_stops = stops.len(), "Line discovery finished");

        tracing::info!(only_trams = self.options.only_trams, "Collecting timetables");
        let timetable = self.collect(&stops, &lines_by_stop).await?;
        tracing::info!(lines = timetable.line_count(), "Timetables assembled");

        Ok(Snapshot {
            collected_on,
            only_trams: self.options.only_trams,
            stops,
            lines_by_stop,
            timetable,
        })
    }

    /// Ask every stop which lines serve it; stops with none are dropped.
    ///
    /// This is a filtering step, not an error: the directory lists posts
    /// that no longer see scheduled service.
    async fn discover_lines(
        &self,
        stops: Vec<Stop>,
    ) -> Result<(Vec<Stop>, BTreeMap<StopId, Vec<Line>>), ApiError> {
        let mut active = Vec::with_capacity(stops.len());
        let mut lines_by_stop = BTreeMap::new();

        for stop in stops {
            let lines = self.api.lines_at(&stop.id).await?;
            if lines.is_empty() {
                tracing::debug!(stop = %stop.id, "No lines, dropping stop");
                continue;
            }
            tracing::debug!(stop = %stop.id, lines = lines.len(), "Lines discovered");
            lines_by_stop.insert(stop.id.clone(), lines);
            active.push(stop);
        }

        Ok((active, lines_by_stop))
    }

    /// Fetch departures for every remaining (stop, line) pair and merge
    /// them into per-line trip groups.
    async fn collect(
        &self,
        stops: &[Stop],
        lines_by_stop: &BTreeMap<StopId, Vec<Line>>,
    ) -> Result<Timetable, ApiError> {
        let mut timetable = Timetable::new();

        for stop in stops {
            let Some(lines) = lines_by_stop.get(&stop.id) else {
                continue;
            };

            for line in lines {
                if self.options.only_trams && VehicleKind::of(line) != VehicleKind::Tram {
                    continue;
                }

                let departures = self.api.departures(&stop.id, line).await?;
                tracing::debug!(
                    stop = %stop.id,
                    line = %line,
                    departures = departures.len(),
                    "Departures fetched"
                );

                for departure in departures {
                    let key = TripKey::new(&departure.brigade, &departure.route);
                    timetable.push(
                        line.clone(),
                        key,
                        TimetableEntry {
                            time: departure.time,
                            stop: stop.id.clone(),
                        },
                    );
                }
            }
        }

        timetable.finish();
        Ok(timetable)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::model::{Departure, Line, Stop, StopId};
    use crate::ports::{ApiError, TransitApi};

    use super::{HarvestOptions, Harvester};

    /// In-memory stand-in for the live API.
    #[derive(Default)]
    struct FakeApi {
        stops: Vec<Stop>,
        lines: HashMap<StopId, Vec<Line>>,
        departures: HashMap<(StopId, Line), Vec<Departure>>,
        fail_departures: bool,
    }

    #[async_trait]
    impl TransitApi for FakeApi {
        async fn stops(&self) -> Result<Vec<Stop>, ApiError> {
            Ok(self.stops.clone())
        }

        async fn lines_at(&self, stop: &StopId) -> Result<Vec<Line>, ApiError> {
            Ok(self.lines.get(stop).cloned().unwrap_or_default())
        }

        async fn departures(
            &self,
            stop: &StopId,
            line: &Line,
        ) -> Result<Vec<Departure>, ApiError> {
            if self.fail_departures {
                return Err(ApiError::MalformedResult("Error: invalid key".to_owned()));
            }
            Ok(self
                .departures
                .get(&(stop.clone(), line.clone()))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn stop(group: &str, post: &str) -> Stop {
        Stop {
            id: StopId::new(group, post),
            name: format!("Stop {group}"),
            street_id: "1234".to_owned(),
            lat: Some(52.25),
            lon: Some(21.0),
            direction: "al.Zieleniecka".to_owned(),
            valid_from: None,
        }
    }

    fn departure(raw_time: &str, brigade: &str, route: &str) -> Departure {
        Departure {
            time: raw_time.parse().expect("test time should parse"),
            brigade: brigade.to_owned(),
            route: route.to_owned(),
        }
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 13).expect("valid date")
    }

    #[tokio::test]
    async fn stops_without_lines_are_dropped() {
        let served = stop("7009", "01");
        let dead = stop("9999", "02");
        let mut api = FakeApi {
            stops: vec![served.clone(), dead],
            ..FakeApi::default()
        };
        api.lines.insert(served.id.clone(), vec![Line("4".to_owned())]);

        let harvester = Harvester::new(Arc::new(api), HarvestOptions::default());
        let snapshot = harvester.run(run_date()).await.expect("run succeeds");

        assert_eq!(snapshot.stops.len(), 1);
        assert_eq!(snapshot.stops.first().map(|kept| kept.id.clone()), Some(served.id));
    }

    #[tokio::test]
    async fn only_trams_skips_other_kinds() {
        let post = stop("7009", "01");
        let tram = Line("4".to_owned());
        let bus = Line("180".to_owned());

        let mut api = FakeApi {
            stops: vec![post.clone()],
            ..FakeApi::default()
        };
        api.lines
            .insert(post.id.clone(), vec![tram.clone(), bus.clone()]);
        api.departures.insert(
            (post.id.clone(), tram.clone()),
            vec![departure("10:00:00", "1", "TP-A")],
        );
        api.departures.insert(
            (post.id.clone(), bus.clone()),
            vec![departure("10:05:00", "2", "TP-B")],
        );

        let harvester = Harvester::new(
            Arc::new(api),
            HarvestOptions { only_trams: true },
        );
        let snapshot = harvester.run(run_date()).await.expect("run succeeds");

        assert!(snapshot.timetable.trips(&tram).is_some());
        assert!(snapshot.timetable.trips(&bus).is_none());
    }

    #[tokio::test]
    async fn departures_from_many_stops_merge_under_one_trip_key() {
        let first = stop("1001", "01");
        let second = stop("2002", "01");
        let line = Line("26".to_owned());

        let mut api = FakeApi {
            stops: vec![first.clone(), second.clone()],
            ..FakeApi::default()
        };
        for post in [&first, &second] {
            api.lines.insert(post.id.clone(), vec![line.clone()]);
        }
        api.departures.insert(
            (first.id.clone(), line.clone()),
            vec![departure("10:20:00", "05", "TD-OST")],
        );
        api.departures.insert(
            (second.id.clone(), line.clone()),
            vec![departure("10:12:00", "05", "TD-OST")],
        );

        let harvester = Harvester::new(Arc::new(api), HarvestOptions::default());
        let snapshot = harvester.run(run_date()).await.expect("run succeeds");

        let trips = snapshot.timetable.trips(&line).expect("line collected");
        let entries = trips.values().next().expect("one trip group");
        assert_eq!(entries.len(), 2);
        // Merged across stops, then re-sorted by time.
        assert_eq!(entries.first().map(|entry| entry.stop.clone()), Some(second.id));
    }

    #[tokio::test]
    async fn schema_error_from_the_api_aborts_the_run() {
        let post = stop("7009", "01");
        let mut api = FakeApi {
            stops: vec![post.clone()],
            fail_departures: true,
            ..FakeApi::default()
        };
        api.lines.insert(post.id.clone(), vec![Line("4".to_owned())]);

        let harvester = Harvester::new(Arc::new(api), HarvestOptions::default());
        let result = harvester.run(run_date()).await;

        assert!(matches!(result, Err(ApiError::MalformedResult(_))));
    }

    #[tokio::test]
    async fn all_lines_filtered_out_is_still_a_success() {
        let post = stop("7009", "01");
        let mut api = FakeApi {
            stops: vec![post.clone()],
            ..FakeApi::default()
        };
        api.lines.insert(post.id.clone(), vec![Line("180".to_owned())]);

        let harvester = Harvester::new(
            Arc::new(api),
            HarvestOptions { only_trams: true },
        );
        let snapshot = harvester.run(run_date()).await.expect("degraded run succeeds");

        assert!(snapshot.timetable.is_empty());
        assert_eq!(snapshot.stops.len(), 1);
    }
}
