use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use chrono_tz::Europe::London;
use paddock_core::names::{name_key, normalize_course_name};
use paddock_core::{real_price, MarketPrices, PriceFeedRace, PriceFeedRunner, PriceFields, Region};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{parse_document, AdapterError, Parsed, RawPayload, SkippedRecord, SourceAdapter, SourceLocator};

const EVENT_DT_FORMATS: [&str; 6] = [
    "%d-%m-%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

#[derive(Debug, Deserialize)]
struct PriceFeedDocument {
    #[serde(default)]
    markets: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    market_type: String,
    event_id: JsonValue,
    menu_hint: String,
    event_name: String,
    event_dt: String,
    #[serde(default)]
    selections: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct RawSelection {
    #[serde(default)]
    selection_id: Option<i64>,
    selection_name: String,
    #[serde(default)]
    bsp: Option<f64>,
    #[serde(default)]
    ppwap: Option<f64>,
    #[serde(default)]
    morning_wap: Option<f64>,
    #[serde(default)]
    pp_max: Option<f64>,
    #[serde(default)]
    pp_min: Option<f64>,
    #[serde(default)]
    ip_max: Option<f64>,
    #[serde(default)]
    ip_min: Option<f64>,
    #[serde(default)]
    morning_traded_vol: Option<f64>,
    #[serde(default)]
    pp_traded_vol: Option<f64>,
    #[serde(default)]
    ip_traded_vol: Option<f64>,
}

impl RawSelection {
    fn prices(&self) -> MarketPrices {
        let volume = |v: Option<f64>| v.filter(|v| v.is_finite() && *v >= 0.0);
        MarketPrices {
            bsp: real_price(self.bsp),
            ppwap: real_price(self.ppwap),
            morning_wap: real_price(self.morning_wap),
            pp_max: real_price(self.pp_max),
            pp_min: real_price(self.pp_min),
            ip_max: real_price(self.ip_max),
            ip_min: real_price(self.ip_min),
            morning_traded_vol: volume(self.morning_traded_vol),
            pp_traded_vol: volume(self.pp_traded_vol),
            ip_traded_vol: volume(self.ip_traded_vol),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarketKind {
    Win,
    Place,
}

#[derive(Debug)]
struct ParsedMarket {
    kind: MarketKind,
    race: PriceFeedRace,
}

/// Exchange settlement export. WIN and PLACE markets of one event are folded
/// into a single race. The export filed under day D may hold another day's
/// races; `day_offset` says which file to read for a race date.
#[derive(Debug, Clone)]
pub struct PriceFeedAdapter {
    source_id: String,
    locator: SourceLocator,
    day_offset: i64,
}

impl PriceFeedAdapter {
    pub fn new(source_id: impl Into<String>, locator: SourceLocator, day_offset: i64) -> Self {
        Self {
            source_id: source_id.into(),
            locator,
            day_offset,
        }
    }
}

#[async_trait]
impl SourceAdapter for PriceFeedAdapter {
    type Record = PriceFeedRace;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    fn payload_date(&self, race_date: NaiveDate) -> NaiveDate {
        race_date + Duration::days(self.day_offset)
    }

    fn parse(
        &self,
        race_date: NaiveDate,
        payload: &RawPayload,
    ) -> Result<Parsed<PriceFeedRace>, AdapterError> {
        let document: PriceFeedDocument = parse_document(payload)?;
        let mut skipped = Vec::new();
        let mut markets = Vec::new();

        for (index, value) in document.markets.into_iter().enumerate() {
            match market_from_value(value) {
                Ok((market, bad_selections)) => {
                    for reason in bad_selections {
                        warn!(source_id = %self.source_id, index, %reason, "skipping selection");
                        skipped.push(SkippedRecord { index, reason });
                    }
                    markets.push(market);
                }
                Err(reason) => {
                    warn!(source_id = %self.source_id, index, %reason, "skipping market");
                    skipped.push(SkippedRecord { index, reason });
                }
            }
        }

        let folded = fold_markets(markets);
        let total = folded.len();
        let records: Vec<PriceFeedRace> = folded
            .into_iter()
            .filter(|race| race.date == race_date)
            .collect();
        if records.len() < total {
            debug!(
                source_id = %self.source_id,
                %race_date,
                other_days = total - records.len(),
                "dropped races belonging to other days"
            );
        }

        Ok(Parsed { records, skipped })
    }
}

fn market_from_value(value: JsonValue) -> Result<(ParsedMarket, Vec<String>), String> {
    let raw: RawMarket = serde_json::from_value(value).map_err(|e| format!("malformed market: {e}"))?;
    let kind = match raw.market_type.trim().to_ascii_uppercase().as_str() {
        "WIN" => MarketKind::Win,
        "PLACE" => MarketKind::Place,
        other => return Err(format!("unsupported market type {other:?}")),
    };
    let event_id = match &raw.event_id {
        JsonValue::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => return Err(format!("unusable event id {other}")),
    };
    let starts_at = parse_event_dt(&raw.event_dt)
        .ok_or_else(|| format!("unparseable event_dt {:?}", raw.event_dt))?;
    let (region, venue) = venue_from_menu_hint(&raw.menu_hint);
    if venue.is_empty() {
        return Err(format!("no venue in menu hint {:?}", raw.menu_hint));
    }

    let mut bad_selections = Vec::new();
    let mut runners = Vec::with_capacity(raw.selections.len());
    for value in raw.selections {
        match serde_json::from_value::<RawSelection>(value) {
            Ok(selection) => {
                let market = selection.prices();
                let prices = match kind {
                    MarketKind::Win => PriceFields {
                        win: market,
                        ..Default::default()
                    },
                    MarketKind::Place => PriceFields {
                        place: market,
                        ..Default::default()
                    },
                };
                runners.push(PriceFeedRunner {
                    selection_id: selection.selection_id,
                    name: selection.selection_name,
                    prices,
                });
            }
            Err(e) => bad_selections.push(format!("malformed selection in event {event_id}: {e}")),
        }
    }

    let minute = starts_at.time().format("%H:%M").to_string();
    Ok((
        ParsedMarket {
            kind,
            race: PriceFeedRace {
                event_id,
                date: starts_at.date(),
                region,
                venue,
                event_time: minute,
                event_name: raw.event_name.trim().to_string(),
                runners,
            },
        },
        bad_selections,
    ))
}

/// WIN markets define the races; PLACE markets only add place prices to the
/// WIN race at the same venue and start time.
fn fold_markets(markets: Vec<ParsedMarket>) -> Vec<PriceFeedRace> {
    let slot = |race: &PriceFeedRace| {
        (
            race.date,
            normalize_course_name(&race.venue),
            race.event_time.clone(),
        )
    };

    let (wins, places): (Vec<_>, Vec<_>) = markets
        .into_iter()
        .partition(|m| m.kind == MarketKind::Win);

    let mut races: Vec<PriceFeedRace> = Vec::with_capacity(wins.len());
    let mut by_slot = HashMap::new();
    for market in wins {
        let key = slot(&market.race);
        if by_slot.contains_key(&key) {
            warn!(event_id = %market.race.event_id, venue = %market.race.venue, "duplicate WIN market ignored");
            continue;
        }
        by_slot.insert(key, races.len());
        races.push(market.race);
    }

    for market in places {
        let Some(&index) = by_slot.get(&slot(&market.race)) else {
            debug!(event_id = %market.race.event_id, venue = %market.race.venue, "PLACE market without WIN market");
            continue;
        };
        let race = &mut races[index];
        let positions: HashMap<String, usize> = race
            .runners
            .iter()
            .enumerate()
            .map(|(i, r)| (name_key(&r.name), i))
            .collect();
        for runner in market.race.runners {
            if let Some(&i) = positions.get(&name_key(&runner.name)) {
                race.runners[i].prices.place = runner.prices.place;
            }
        }
    }

    races
}

/// Event start as UK local wall-clock time. Offset-bearing timestamps are
/// shifted into Europe/London; naive ones are taken as already local.
pub fn parse_event_dt(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.with_timezone(&London).naive_local());
    }
    EVENT_DT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

/// `"GB / Ascot 13th Jan"` -> `(Some(GB), "Ascot")`.
pub fn venue_from_menu_hint(hint: &str) -> (Option<Region>, String) {
    let (region, rest) = match hint.split_once(" / ") {
        Some((prefix, rest)) => match Region::from_source(prefix) {
            Ok(region) => (Some(region), rest),
            Err(_) => (None, hint),
        },
        None => (None, hint),
    };

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut end = tokens.len();
    if end >= 3 && is_month(tokens[end - 1]) && is_ordinal_day(tokens[end - 2]) {
        end -= 2;
    }
    (region, tokens[..end].join(" "))
}

fn is_month(token: &str) -> bool {
    let lowered = token.to_ascii_lowercase();
    lowered.len() >= 3
        && lowered.chars().all(|c| c.is_ascii_alphabetic())
        && MONTHS.iter().any(|m| lowered.starts_with(m))
}

fn is_ordinal_day(token: &str) -> bool {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    let suffix = &token[digits.len()..];
    !digits.is_empty()
        && digits.len() <= 2
        && ["", "st", "nd", "rd", "th"].contains(&suffix.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 13).unwrap()
    }

    fn payload(body: JsonValue) -> RawPayload {
        RawPayload {
            source_id: "price-feed".into(),
            payload_date: day(),
            origin: "inline".into(),
            content_type: "application/json".into(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn adapter(day_offset: i64) -> PriceFeedAdapter {
        PriceFeedAdapter::new("price-feed", SourceLocator::http("unused"), day_offset)
    }

    #[test]
    fn menu_hint_yields_region_and_venue() {
        assert_eq!(
            venue_from_menu_hint("GB / Ascot 13th Jan"),
            (Some(Region::Gb), "Ascot".to_string())
        );
        assert_eq!(
            venue_from_menu_hint("Kempton (AW) 3rd Feb"),
            (None, "Kempton (AW)".to_string())
        );
        assert_eq!(
            venue_from_menu_hint("IRE / Leopardstown"),
            (Some(Region::Ire), "Leopardstown".to_string())
        );
    }

    #[test]
    fn event_times_are_uk_local() {
        let summer = parse_event_dt("2024-06-18T13:30:00Z").unwrap();
        assert_eq!(summer.format("%H:%M").to_string(), "14:30");
        let winter = parse_event_dt("2024-01-13T14:31:00+00:00").unwrap();
        assert_eq!(winter.format("%H:%M").to_string(), "14:31");
        let exported = parse_event_dt("13-01-2024 14:31").unwrap();
        assert_eq!(exported.date(), day());
        assert!(parse_event_dt("tomorrow").is_none());
    }

    #[test]
    fn place_prices_fold_into_the_win_race() {
        let body = json!({"markets": [
            {"market_type": "WIN", "event_id": 101, "menu_hint": "GB / Ascot 13th Jan",
             "event_name": "2m5f Hcap Chs", "event_dt": "13-01-2024 14:31",
             "selections": [
                {"selection_id": 1, "selection_name": "Frankel", "bsp": 3.5, "ppwap": 3.4},
                {"selection_id": 2, "selection_name": "Enable", "bsp": 0.0}
             ]},
            {"market_type": "PLACE", "event_id": "102", "menu_hint": "GB / Ascot 13th Jan",
             "event_name": "To Be Placed", "event_dt": "13-01-2024 14:31",
             "selections": [{"selection_name": "Frankel", "bsp": 1.4}]}
        ]});

        let parsed = adapter(0).parse(day(), &payload(body)).unwrap();
        assert!(parsed.skipped.is_empty());
        assert_eq!(parsed.records.len(), 1);
        let race = &parsed.records[0];
        assert_eq!(race.event_id, "101");
        assert_eq!(race.venue, "Ascot");
        assert_eq!(race.event_time, "14:31");
        assert_eq!(race.runners[0].prices.win.bsp, Some(3.5));
        assert_eq!(race.runners[0].prices.place.bsp, Some(1.4));
        // 0.0 is the feed's "no price" placeholder
        assert_eq!(race.runners[1].prices.win.bsp, None);
    }

    #[test]
    fn malformed_markets_are_skipped_and_other_days_filtered() {
        let body = json!({"markets": [
            {"market_type": "WIN", "event_id": 1, "menu_hint": "Ascot 12th Jan",
             "event_name": "Hurdle", "event_dt": "12-01-2024 15:00", "selections": []},
            {"market_type": "WIN", "event_id": 2, "menu_hint": "Ascot 13th Jan",
             "event_name": "Hurdle", "event_dt": "not a time", "selections": []},
            {"market_type": "WIN", "event_id": 3, "menu_hint": "Ascot 13th Jan",
             "event_name": "Chase", "event_dt": "13-01-2024 15:05",
             "selections": [{"selection_id": 9}]}
        ]});

        let parsed = adapter(1).parse(day(), &payload(body)).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].event_id, "3");
        assert!(parsed.records[0].runners.is_empty());
        assert_eq!(parsed.skipped.len(), 2);
    }

    #[test]
    fn day_offset_selects_the_payload_date() {
        assert_eq!(adapter(1).payload_date(day()), NaiveDate::from_ymd_opt(2024, 1, 14).unwrap());
        assert_eq!(adapter(0).payload_date(day()), day());
    }
}
