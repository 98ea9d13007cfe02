//! Off-time normalization and minute-level tolerance windows.
//!
//! Times are same-day minute-of-day values. Nothing here wraps across midnight.

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Canonical `HH:MM` for `HH:MM`, `HH:MM:SS`, `H:MM`, `HHMM` and `HMM` input.
/// Anything else is returned unchanged so bad data stays visible downstream.
pub fn normalize_time_to_hhmm(raw: &str) -> String {
    match parse_minute_of_day(raw) {
        Some(minute) => format_minute(minute),
        None => raw.to_string(),
    }
}

pub fn parse_minute_of_day(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    let (hours, minutes) = if raw.contains(':') {
        let mut parts = raw.split(':');
        let hours = parts.next()?;
        let minutes = parts.next()?;
        if let Some(seconds) = parts.next() {
            if seconds.len() != 2 || !all_digits(seconds) {
                return None;
            }
        }
        if parts.next().is_some() || !(1..=2).contains(&hours.len()) || minutes.len() != 2 {
            return None;
        }
        (hours, minutes)
    } else if matches!(raw.len(), 3 | 4) && all_digits(raw) {
        raw.split_at(raw.len() - 2)
    } else {
        return None;
    };

    if !all_digits(hours) || !all_digits(minutes) {
        return None;
    }
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

pub fn format_minute(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// `[t - 1min, t, t + 1min]`, clamped to the same day. At `00:00` and `23:59`
/// the out-of-day neighbour is replaced by `t` itself. Unparseable input yields
/// three copies of the input.
pub fn time_variants(hhmm: &str) -> [String; 3] {
    match parse_minute_of_day(hhmm) {
        Some(minute) => [
            format_minute(minute.saturating_sub(1)),
            format_minute(minute),
            format_minute((minute + 1).min(MINUTES_PER_DAY - 1)),
        ],
        None => [hhmm.to_string(), hhmm.to_string(), hhmm.to_string()],
    }
}

/// Absolute minute-of-day distance, or `None` when either side is unparseable.
pub fn time_window_minutes(a: &str, b: &str) -> Option<u32> {
    let a = parse_minute_of_day(a)?;
    let b = parse_minute_of_day(b)?;
    Some(u32::from(a.abs_diff(b)))
}

fn all_digits(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}
