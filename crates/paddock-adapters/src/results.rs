use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use paddock_core::names::name_key;
use paddock_core::times::{normalize_time_to_hhmm, parse_minute_of_day};
use paddock_core::{RaceType, Region, ResultsRace, ResultsRunner};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{parse_document, AdapterError, Parsed, RawPayload, SkippedRecord, SourceAdapter, SourceLocator};

#[derive(Debug, Deserialize)]
struct ResultsDocument {
    #[serde(default)]
    races: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawRace {
    region: String,
    course: String,
    off_time: String,
    race_name: String,
    race_type: String,
    #[serde(default)]
    distance: Option<String>,
    #[serde(default)]
    going: Option<String>,
    #[serde(default)]
    race_class: Option<String>,
    #[serde(default)]
    runners: Vec<ResultsRunner>,
}

/// Results/racecard source: one JSON document per race day.
#[derive(Debug, Clone)]
pub struct ResultsAdapter {
    source_id: String,
    locator: SourceLocator,
}

impl ResultsAdapter {
    pub fn new(source_id: impl Into<String>, locator: SourceLocator) -> Self {
        Self {
            source_id: source_id.into(),
            locator,
        }
    }
}

#[async_trait]
impl SourceAdapter for ResultsAdapter {
    type Record = ResultsRace;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    fn parse(
        &self,
        race_date: NaiveDate,
        payload: &RawPayload,
    ) -> Result<Parsed<ResultsRace>, AdapterError> {
        let document: ResultsDocument = parse_document(payload)?;
        let mut parsed = Parsed::default();

        for (index, value) in document.races.into_iter().enumerate() {
            match race_from_value(race_date, value) {
                Ok(race) => parsed.records.push(race),
                Err(reason) => {
                    warn!(source_id = %self.source_id, index, %reason, "skipping results race");
                    parsed.skipped.push(SkippedRecord { index, reason });
                }
            }
        }
        Ok(parsed)
    }
}

fn race_from_value(race_date: NaiveDate, value: JsonValue) -> Result<ResultsRace, String> {
    let raw: RawRace = serde_json::from_value(value).map_err(|e| format!("malformed race: {e}"))?;
    let region = Region::from_source(&raw.region).map_err(|e| e.to_string())?;
    let race_type = RaceType::from_source(&raw.race_type).map_err(|e| e.to_string())?;

    let off_time = normalize_time_to_hhmm(&raw.off_time);
    if parse_minute_of_day(&off_time).is_none() {
        warn!(course = %raw.course, off_time = %raw.off_time, "unrecognised off time kept as-is");
    }

    let mut seen = HashSet::new();
    let mut runners = Vec::with_capacity(raw.runners.len());
    for runner in raw.runners {
        if !seen.insert(name_key(&runner.horse)) {
            warn!(course = %raw.course, %off_time, horse = %runner.horse, "duplicate runner dropped");
            continue;
        }
        runners.push(runner);
    }

    Ok(ResultsRace {
        date: race_date,
        region,
        course: raw.course.trim().to_string(),
        off_time,
        race_name: raw.race_name.trim().to_string(),
        race_type,
        distance: raw.distance,
        going: raw.going,
        race_class: raw.race_class,
        runners,
    })
}
