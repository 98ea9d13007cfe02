//! Content-addressed race and runner keys.
//!
//! The normalization applied here is part of the key contract: changing it
//! changes every key and breaks idempotent re-ingestion of stored dates.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::names::{name_key, normalize_course_name, normalize_name};
use crate::times::normalize_time_to_hhmm;
use crate::{RaceType, Region};

pub fn race_key(
    date: NaiveDate,
    region: Region,
    course: &str,
    off_time: &str,
    race_name: &str,
    race_type: RaceType,
) -> String {
    digest(&[
        &date.format("%Y-%m-%d").to_string(),
        region.as_str(),
        &normalize_course_name(course),
        &normalize_time_to_hhmm(off_time),
        &normalize_name(race_name),
        race_type.as_str(),
    ])
}

pub fn runner_key(race_key: &str, horse: &str, number: Option<u32>, draw: Option<u32>) -> String {
    digest(&[
        race_key,
        &name_key(horse),
        &number.map(|n| n.to_string()).unwrap_or_default(),
        &draw.map(|d| d.to_string()).unwrap_or_default(),
    ])
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 13).unwrap()
    }

    #[test]
    fn race_key_ignores_source_spelling() {
        let a = race_key(day(), Region::Gb, "Ascot", "14:30", "Betfair Hurdle", RaceType::Hurdle);
        let b = race_key(day(), Region::Gb, "ascot ", "1430", "BETFAIR  HURDLE", RaceType::Hurdle);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn race_key_separates_distinct_races() {
        let base = race_key(day(), Region::Gb, "Ascot", "14:30", "Race", RaceType::Flat);
        assert_ne!(base, race_key(day(), Region::Ire, "Ascot", "14:30", "Race", RaceType::Flat));
        assert_ne!(base, race_key(day(), Region::Gb, "Ascot", "15:05", "Race", RaceType::Flat));
        assert_ne!(base, race_key(day(), Region::Gb, "Ascot", "14:30", "Race", RaceType::Chase));
        let next_day = day().succ_opt().unwrap();
        assert_ne!(base, race_key(next_day, Region::Gb, "Ascot", "14:30", "Race", RaceType::Flat));
    }

    #[test]
    fn runner_key_depends_on_number_and_draw() {
        let race = race_key(day(), Region::Gb, "Ascot", "14:30", "Race", RaceType::Flat);
        let a = runner_key(&race, "O'Brien Star", Some(3), Some(7));
        assert_eq!(a, runner_key(&race, "OBrien Star", Some(3), Some(7)));
        assert_ne!(a, runner_key(&race, "O'Brien Star", Some(4), Some(7)));
        assert_ne!(a, runner_key(&race, "O'Brien Star", Some(3), None));
    }
}
