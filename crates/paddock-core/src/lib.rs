//! Core domain model for cross-source race/price reconciliation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod keys;
pub mod names;
pub mod times;

pub const CRATE_NAME: &str = "paddock-core";

/// Smallest price an exchange will match at. Values below it are placeholders
/// written by the feed for "no price", never real odds.
pub const MIN_REAL_PRICE: f64 = 1.01;

/// Keeps a price only when it clears [`MIN_REAL_PRICE`].
pub fn real_price(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= MIN_REAL_PRICE)
}

/// A source value that has no counterpart in the closed vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("unmapped region {0:?}")]
    Region(String),
    #[error("unmapped race type {0:?}")]
    RaceType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "GB")]
    Gb,
    #[serde(rename = "IRE")]
    Ire,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Gb => "GB",
            Region::Ire => "IRE",
        }
    }

    /// Maps each source's spelling ("gb", "uk", "IRE", "ie", ...) onto the closed set.
    pub fn from_source(raw: &str) -> Result<Self, MappingError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GB" | "UK" | "GBR" | "ENG" | "SCO" | "WAL" => Ok(Region::Gb),
            "IRE" | "IE" | "IRL" => Ok(Region::Ire),
            _ => Err(MappingError::Region(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RaceType {
    Flat,
    Hurdle,
    Chase,
    #[serde(rename = "NH Flat")]
    NhFlat,
}

impl RaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceType::Flat => "Flat",
            RaceType::Hurdle => "Hurdle",
            RaceType::Chase => "Chase",
            RaceType::NhFlat => "NH Flat",
        }
    }

    /// Maps source race-type text onto the closed set. Handicap qualifiers are
    /// ignored here (see [`names::signals_handicap`]); a bare "Handicap" carries
    /// no code information and is rejected.
    pub fn from_source(raw: &str) -> Result<Self, MappingError> {
        let squashed: String = raw
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        if squashed.contains("nhflat")
            || squashed.contains("nationalhuntflat")
            || squashed.contains("bumper")
        {
            Ok(RaceType::NhFlat)
        } else if squashed.contains("chase") || squashed.contains("chs") {
            Ok(RaceType::Chase)
        } else if squashed.contains("hurdle") || squashed.contains("hrd") || squashed.contains("hdl")
        {
            Ok(RaceType::Hurdle)
        } else if squashed.contains("flat") {
            Ok(RaceType::Flat)
        } else {
            Err(MappingError::RaceType(raw.to_string()))
        }
    }
}

/// One runner as published by the results/racecard source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultsRunner {
    pub horse: String,
    pub number: Option<u32>,
    pub draw: Option<u32>,
    pub position: Option<String>,
    pub jockey: Option<String>,
    pub trainer: Option<String>,
    pub owner: Option<String>,
    pub weight_lbs: Option<u32>,
    pub official_rating: Option<u32>,
    pub rpr: Option<u32>,
    pub ts: Option<u32>,
    pub comment: Option<String>,
}

/// Authoritative race description from the results/racecard source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsRace {
    pub date: NaiveDate,
    pub region: Region,
    pub course: String,
    /// Canonical `HH:MM`.
    pub off_time: String,
    pub race_name: String,
    pub race_type: RaceType,
    pub distance: Option<String>,
    pub going: Option<String>,
    pub race_class: Option<String>,
    pub runners: Vec<ResultsRunner>,
}

/// Settlement and weighted-average prices for one market (WIN or PLACE).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketPrices {
    pub bsp: Option<f64>,
    pub ppwap: Option<f64>,
    pub morning_wap: Option<f64>,
    pub pp_max: Option<f64>,
    pub pp_min: Option<f64>,
    pub ip_max: Option<f64>,
    pub ip_min: Option<f64>,
    pub morning_traded_vol: Option<f64>,
    pub pp_traded_vol: Option<f64>,
    pub ip_traded_vol: Option<f64>,
}

impl MarketPrices {
    pub fn is_empty(&self) -> bool {
        *self == MarketPrices::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceFields {
    pub win: MarketPrices,
    pub place: MarketPrices,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceFeedRunner {
    pub selection_id: Option<i64>,
    pub name: String,
    pub prices: PriceFields,
}

/// Race description as reconstructed from the exchange price feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceFeedRace {
    pub event_id: String,
    pub date: NaiveDate,
    pub region: Option<Region>,
    pub venue: String,
    /// Canonical `HH:MM`.
    pub event_time: String,
    pub event_name: String,
    pub runners: Vec<PriceFeedRunner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    CourseTime,
    NameTime,
    RunnerSimilarity,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::CourseTime => "course_time",
            MatchTier::NameTime => "name_time",
            MatchTier::RunnerSimilarity => "runner_similarity",
        }
    }
}

/// How a race-level match was reached, kept so weak matches can be audited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfidence {
    pub tier: MatchTier,
    pub jaccard: f64,
    pub time_diff_minutes: u32,
}

/// Surrogate keys of the dimension rows a runner references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunnerDimensionIds {
    pub horse_id: Option<i64>,
    pub jockey_id: Option<i64>,
    pub trainer_id: Option<i64>,
    pub owner_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRunner {
    pub runner_key: String,
    pub result: ResultsRunner,
    /// Set only by a successful runner match; `None` means no price was found.
    pub prices: Option<PriceFields>,
    pub dimension_ids: RunnerDimensionIds,
}

impl ReconciledRunner {
    pub fn win_bsp(&self) -> Option<f64> {
        self.prices.as_ref().and_then(|p| p.win.bsp)
    }

    pub fn place_bsp(&self) -> Option<f64> {
        self.prices.as_ref().and_then(|p| p.place.bsp)
    }
}

/// Authoritative race plus whatever the price feed contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRace {
    pub race_key: String,
    pub date: NaiveDate,
    pub region: Region,
    pub course: String,
    pub off_time: String,
    pub race_name: String,
    pub race_type: RaceType,
    pub handicap: bool,
    pub distance: Option<String>,
    pub going: Option<String>,
    pub race_class: Option<String>,
    pub course_id: Option<i64>,
    pub price_event_id: Option<String>,
    pub confidence: Option<MatchConfidence>,
    pub runners: Vec<ReconciledRunner>,
}

impl ReconciledRace {
    /// Builds the unmatched form of a results race with its stable keys.
    pub fn from_results(race: ResultsRace) -> Self {
        let race_key = keys::race_key(
            race.date,
            race.region,
            &race.course,
            &race.off_time,
            &race.race_name,
            race.race_type,
        );
        let runners = race
            .runners
            .into_iter()
            .map(|result| ReconciledRunner {
                runner_key: keys::runner_key(&race_key, &result.horse, result.number, result.draw),
                result,
                prices: None,
                dimension_ids: RunnerDimensionIds::default(),
            })
            .collect();

        Self {
            handicap: names::signals_handicap(&race.race_name),
            race_key,
            date: race.date,
            region: race.region,
            course: race.course,
            off_time: race.off_time,
            race_name: race.race_name,
            race_type: race.race_type,
            distance: race.distance,
            going: race.going,
            race_class: race.race_class,
            course_id: None,
            price_event_id: None,
            confidence: None,
            runners,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.confidence.is_some()
    }
}
