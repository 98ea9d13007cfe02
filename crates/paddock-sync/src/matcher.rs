//! Race- and runner-level matching between the results source and the price
//! feed for one calendar date.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use paddock_core::names::{name_key, normalize_course_name, normalize_name, signals_handicap};
use paddock_core::times::{parse_minute_of_day, time_variants};
use paddock_core::{
    MatchConfidence, MatchTier, PriceFeedRace, PriceFeedRunner, ReconciledRace, ResultsRace,
};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

/// Similarity-fallback matches on fields smaller than this are flagged as weak.
const SMALL_FIELD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    /// Largest off-time gap the similarity fallback will consider.
    pub window_minutes: u32,
    /// Minimum fallback score (Jaccard plus bonuses) to accept a candidate.
    pub accept_score: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            window_minutes: 10,
            accept_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RaceMatch<'a> {
    pub candidate: &'a PriceFeedRace,
    pub confidence: MatchConfidence,
}

/// Lookup structures over one date's price-feed candidates.
///
/// Every candidate is registered under the ±1 minute variants of its own
/// event time, and lookups use the variants of the results off-time, so the
/// key tiers tolerate skew in both directions.
pub struct CandidateIndex<'a> {
    date: NaiveDate,
    candidates: Vec<&'a PriceFeedRace>,
    minutes: Vec<Option<u16>>,
    runner_sets: Vec<BTreeSet<String>>,
    by_course_time: HashMap<String, BTreeSet<usize>>,
    by_name_time: HashMap<String, BTreeSet<usize>>,
    by_minute: BTreeMap<u16, Vec<usize>>,
}

impl<'a> CandidateIndex<'a> {
    /// Candidates dated anything other than `date` are left out of the pool.
    pub fn build(date: NaiveDate, pool: &'a [PriceFeedRace]) -> Self {
        let candidates: Vec<&PriceFeedRace> = pool.iter().filter(|c| c.date == date).collect();
        let mut index = Self {
            date,
            minutes: Vec::with_capacity(candidates.len()),
            runner_sets: Vec::with_capacity(candidates.len()),
            by_course_time: HashMap::new(),
            by_name_time: HashMap::new(),
            by_minute: BTreeMap::new(),
            candidates,
        };

        for (i, candidate) in index.candidates.iter().enumerate() {
            let course = normalize_course_name(&candidate.venue);
            let name = normalize_name(&candidate.event_name);
            for variant in time_variants(&candidate.event_time) {
                if !course.is_empty() {
                    index
                        .by_course_time
                        .entry(lookup_key(date, &course, &variant))
                        .or_default()
                        .insert(i);
                }
                if !name.is_empty() {
                    index
                        .by_name_time
                        .entry(lookup_key(date, &name, &variant))
                        .or_default()
                        .insert(i);
                }
            }

            let minute = parse_minute_of_day(&candidate.event_time);
            if let Some(minute) = minute {
                index.by_minute.entry(minute).or_default().push(i);
            }
            index.minutes.push(minute);
            index.runner_sets.push(runner_set(
                candidate.runners.iter().map(|r| r.name.as_str()),
            ));
        }
        index
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best candidate for `race`, or `None` when nothing qualifies.
    pub fn match_race(&self, race: &ResultsRace, config: &MatchConfig) -> Option<RaceMatch<'a>> {
        if race.date != self.date || self.is_empty() {
            return None;
        }

        let lookup = Lookup {
            minute: parse_minute_of_day(&race.off_time),
            variants: time_variants(&race.off_time),
            runners: runner_set(race.runners.iter().map(|r| r.horse.as_str())),
            runner_count: race.runners.len(),
            handicap: signals_handicap(&race.race_name),
        };

        let course = normalize_course_name(&race.course);
        if let Some(found) = self.lookup_tier(&self.by_course_time, &course, &lookup, MatchTier::CourseTime)
        {
            return Some(found);
        }
        let name = normalize_name(&race.race_name);
        if let Some(found) = self.lookup_tier(&self.by_name_time, &name, &lookup, MatchTier::NameTime) {
            return Some(found);
        }
        self.similarity_scan(&lookup, config)
    }

    fn lookup_tier(
        &self,
        map: &HashMap<String, BTreeSet<usize>>,
        text: &str,
        lookup: &Lookup,
        tier: MatchTier,
    ) -> Option<RaceMatch<'a>> {
        if text.is_empty() {
            return None;
        }
        let hits: BTreeSet<usize> = lookup
            .variants
            .iter()
            .filter_map(|variant| map.get(&lookup_key(self.date, text, variant)))
            .flatten()
            .copied()
            .collect();

        let best = hits.into_iter().min_by(|&a, &b| {
            self.time_diff(lookup, a)
                .cmp(&self.time_diff(lookup, b))
                .then_with(|| self.candidates[a].event_id.cmp(&self.candidates[b].event_id))
        })?;
        Some(self.race_match(best, lookup, tier))
    }

    fn similarity_scan(&self, lookup: &Lookup, config: &MatchConfig) -> Option<RaceMatch<'a>> {
        let minute = lookup.minute?;
        let window = config.window_minutes.min(24 * 60) as u16;
        let lo = minute.saturating_sub(window);
        let hi = minute.saturating_add(window);

        let mut best: Option<(usize, f64)> = None;
        for &i in self.by_minute.range(lo..=hi).flat_map(|(_, group)| group) {
            let overlap = jaccard(&lookup.runners, &self.runner_sets[i]);
            // Bonuses alone never justify a match.
            if overlap == 0.0 {
                continue;
            }
            let candidate = self.candidates[i];
            let mut score = overlap;
            if lookup.runner_count == candidate.runners.len() {
                score += 0.5;
            }
            if lookup.handicap && signals_handicap(&candidate.event_name) {
                score += 0.5;
            }
            if score < config.accept_score {
                continue;
            }

            let better = match best {
                None => true,
                Some((current, current_score)) => match score.partial_cmp(&current_score) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Less) | None => false,
                    Some(Ordering::Equal) => self
                        .time_diff(lookup, i)
                        .cmp(&self.time_diff(lookup, current))
                        .then_with(|| candidate.event_id.cmp(&self.candidates[current].event_id))
                        .is_lt(),
                },
            };
            if better {
                best = Some((i, score));
            }
        }

        let (i, score) = best?;
        debug!(event_id = %self.candidates[i].event_id, score, "accepted runner-similarity candidate");
        Some(self.race_match(i, lookup, MatchTier::RunnerSimilarity))
    }

    fn race_match(&self, i: usize, lookup: &Lookup, tier: MatchTier) -> RaceMatch<'a> {
        RaceMatch {
            candidate: self.candidates[i],
            confidence: MatchConfidence {
                tier,
                jaccard: jaccard(&lookup.runners, &self.runner_sets[i]),
                time_diff_minutes: self.time_diff(lookup, i),
            },
        }
    }

    fn time_diff(&self, lookup: &Lookup, i: usize) -> u32 {
        match (lookup.minute, self.minutes[i]) {
            (Some(a), Some(b)) => u32::from(a.abs_diff(b)),
            _ => 0,
        }
    }
}

struct Lookup {
    minute: Option<u16>,
    variants: [String; 3],
    runners: BTreeSet<String>,
    runner_count: usize,
    handicap: bool,
}

fn lookup_key(date: NaiveDate, text: &str, hhmm: &str) -> String {
    format!("{}|{}|{}", date.format("%Y-%m-%d"), text, hhmm)
}

fn runner_set<'n>(names: impl Iterator<Item = &'n str>) -> BTreeSet<String> {
    names.map(name_key).filter(|k| !k.is_empty()).collect()
}

/// Intersection over union; two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Closest price-feed name for a results runner that found no exact partner.
/// Diagnostic only; prices are never merged on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMiss {
    pub race_key: String,
    pub horse: String,
    pub closest: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunnerMatchOutcome {
    pub priced: usize,
    pub unpriced: usize,
    pub near_misses: Vec<NearMiss>,
}

/// Copies prices onto every runner of `race` whose horse has an exact
/// name-key partner in `candidate`. Price-feed runners without a partner are
/// dropped.
pub fn match_runners(race: &mut ReconciledRace, candidate: &PriceFeedRace) -> RunnerMatchOutcome {
    let mut by_key: HashMap<String, &PriceFeedRunner> = HashMap::new();
    for runner in &candidate.runners {
        by_key.entry(name_key(&runner.name)).or_insert(runner);
    }

    let mut outcome = RunnerMatchOutcome::default();
    let mut claimed = HashSet::new();
    let mut missing = Vec::new();
    for runner in &mut race.runners {
        let key = name_key(&runner.result.horse);
        match by_key.get(&key) {
            Some(partner) => {
                runner.prices = Some(partner.prices);
                claimed.insert(key);
                outcome.priced += 1;
            }
            None => {
                outcome.unpriced += 1;
                missing.push(runner.result.horse.clone());
            }
        }
    }

    for horse in missing {
        let wanted = normalize_name(&horse);
        let closest = candidate
            .runners
            .iter()
            .filter(|r| !claimed.contains(&name_key(&r.name)))
            .map(|r| (r, jaro_winkler(&wanted, &normalize_name(&r.name))))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        if let Some((runner, similarity)) = closest {
            outcome.near_misses.push(NearMiss {
                race_key: race.race_key.clone(),
                horse,
                closest: runner.name.clone(),
                similarity,
            });
        }
    }
    outcome
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedRace {
    pub race_key: String,
    pub course: String,
    pub off_time: String,
    pub race_name: String,
}

/// Counts for one date's matching pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchSummary {
    pub candidates: usize,
    pub races: usize,
    pub matched: usize,
    pub by_tier: BTreeMap<MatchTier, usize>,
    pub unmatched: Vec<UnmatchedRace>,
    pub runners: usize,
    pub runners_priced: usize,
    pub near_misses: Vec<NearMiss>,
    pub key_collisions: usize,
    pub double_claims: usize,
}

impl MatchSummary {
    pub fn match_rate(&self) -> f64 {
        if self.races == 0 {
            0.0
        } else {
            self.matched as f64 / self.races as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DayMatch {
    pub races: Vec<ReconciledRace>,
    pub summary: MatchSummary,
}

/// Matches every results race of `date` against the candidates of the same
/// date and merges runner prices. Unmatched races are kept unpriced.
pub fn match_day(
    date: NaiveDate,
    results: Vec<ResultsRace>,
    pool: &[PriceFeedRace],
    config: &MatchConfig,
) -> DayMatch {
    let index = CandidateIndex::build(date, pool);
    let mut day = DayMatch {
        races: Vec::with_capacity(results.len()),
        summary: MatchSummary {
            candidates: index.len(),
            ..Default::default()
        },
    };
    let mut seen_keys = HashSet::new();
    let mut claims: HashMap<String, String> = HashMap::new();

    for race in results {
        let found = index.match_race(&race, config);
        let mut reconciled = ReconciledRace::from_results(race);
        if !seen_keys.insert(reconciled.race_key.clone()) {
            warn!(
                race_key = %reconciled.race_key,
                course = %reconciled.course,
                off_time = %reconciled.off_time,
                "duplicate race key in batch; later race skipped"
            );
            day.summary.key_collisions += 1;
            continue;
        }

        let summary = &mut day.summary;
        summary.races += 1;
        summary.runners += reconciled.runners.len();

        let Some(found) = found else {
            info!(
                course = %reconciled.course,
                off_time = %reconciled.off_time,
                race_name = %reconciled.race_name,
                "no price-feed match; race kept unpriced"
            );
            summary.unmatched.push(UnmatchedRace {
                race_key: reconciled.race_key.clone(),
                course: reconciled.course.clone(),
                off_time: reconciled.off_time.clone(),
                race_name: reconciled.race_name.clone(),
            });
            day.races.push(reconciled);
            continue;
        };

        let candidate = found.candidate;
        let confidence = found.confidence;
        if let Some(previous) = claims.insert(candidate.event_id.clone(), reconciled.race_key.clone()) {
            warn!(
                event_id = %candidate.event_id,
                first_race = %previous,
                race_key = %reconciled.race_key,
                "price-feed candidate matched more than one race"
            );
            summary.double_claims += 1;
        }
        if confidence.tier == MatchTier::RunnerSimilarity
            && reconciled.runners.len().min(candidate.runners.len()) < SMALL_FIELD
        {
            warn!(
                course = %reconciled.course,
                off_time = %reconciled.off_time,
                event_id = %candidate.event_id,
                jaccard = confidence.jaccard,
                "low-confidence match on a small field"
            );
        }

        reconciled.price_event_id = Some(candidate.event_id.clone());
        reconciled.confidence = Some(confidence);
        let runners = match_runners(&mut reconciled, candidate);
        summary.matched += 1;
        *summary.by_tier.entry(confidence.tier).or_default() += 1;
        summary.runners_priced += runners.priced;
        summary.near_misses.extend(runners.near_misses);
        day.races.push(reconciled);
    }

    debug!(
        %date,
        races = day.summary.races,
        matched = day.summary.matched,
        candidates = day.summary.candidates,
        "matched day"
    );
    day
}
