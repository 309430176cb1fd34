//! Natural-language date phrases → [`DateRange`].
//!
//! Recognized: `today`, `yesterday`, `this|last week`, `past week`,
//! `this|last month`, `this|last year`, `N days ago`, `last|past N days`,
//! `[this|last] <weekday>`. Weeks start on Monday. All ranges are whole UTC
//! calendar days.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::memory::types::DateRange;

const NUMBER_WORDS: &[(&str, i64)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
];

fn parse_number(word: &str) -> Option<i64> {
    word.parse::<i64>()
        .ok()
        .or_else(|| NUMBER_WORDS.iter().find(|(w, _)| *w == word).map(|(_, n)| *n))
        .filter(|n| (0..=3650).contains(n))
}

fn parse_weekday(word: &str) -> Option<Weekday> {
    match word {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn single_day(day: NaiveDate) -> DateRange {
    DateRange::days(day, day)
}

fn first_of_month(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

/// Most recent `weekday` on or before `today`; with `strictly_before`, a
/// match on `today` itself goes back a week.
fn previous_weekday(today: NaiveDate, weekday: Weekday, strictly_before: bool) -> NaiveDate {
    let current = i64::from(today.weekday().num_days_from_monday());
    let target = i64::from(weekday.num_days_from_monday());
    let mut back = (current - target).rem_euclid(7);
    if back == 0 && strictly_before {
        back = 7;
    }
    today - Duration::days(back)
}

fn relative_period(qualifier: &str, unit: &str, today: NaiveDate) -> Option<DateRange> {
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    match (qualifier, unit) {
        ("this", "week") => Some(DateRange::days(monday, today)),
        ("last" | "previous", "week") => Some(DateRange::days(
            monday - Duration::days(7),
            monday - Duration::days(1),
        )),
        ("past", "week") => Some(DateRange::days(today - Duration::days(7), today)),
        ("this", "month") => Some(DateRange::days(first_of_month(today), today)),
        ("last" | "previous", "month") => {
            let end = first_of_month(today) - Duration::days(1);
            Some(DateRange::days(first_of_month(end), end))
        }
        ("past", "month") => Some(DateRange::days(today - Duration::days(30), today)),
        ("this", "year") => {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
            Some(DateRange::days(start, today))
        }
        ("last" | "previous", "year") => {
            let start = NaiveDate::from_ymd_opt(today.year() - 1, 1, 1)?;
            let end = NaiveDate::from_ymd_opt(today.year() - 1, 12, 31)?;
            Some(DateRange::days(start, end))
        }
        _ => None,
    }
}

/// Find the first date phrase inside free text. `None` when the text
/// carries no temporal constraint.
pub fn extract_date_range(text: &str, today: NaiveDate) -> Option<DateRange> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    for (i, &tok) in tokens.iter().enumerate() {
        let next = tokens.get(i + 1).copied();
        let after = tokens.get(i + 2).copied();

        match tok {
            "today" => return Some(single_day(today)),
            "yesterday" => return Some(single_day(today - Duration::days(1))),
            "this" | "last" | "past" | "previous" => {
                let Some(next) = next else { continue };
                if let Some(range) = relative_period(tok, next, today) {
                    return Some(range);
                }
                if let Some(weekday) = parse_weekday(next) {
                    let strict = tok != "this";
                    return Some(single_day(previous_weekday(today, weekday, strict)));
                }
                // "last 3 days", "past two days"
                if tok != "this" {
                    if let (Some(n), Some("day" | "days")) = (parse_number(next), after) {
                        return Some(DateRange::days(today - Duration::days(n), today));
                    }
                }
            }
            _ => {
                if let (Some(n), Some("day" | "days"), Some("ago")) =
                    (parse_number(tok), next, after)
                {
                    return Some(single_day(today - Duration::days(n)));
                }
                if let Some(weekday) = parse_weekday(tok) {
                    let qualified = i > 0
                        && matches!(tokens[i - 1], "this" | "last" | "past" | "previous");
                    if !qualified {
                        return Some(single_day(previous_weekday(today, weekday, false)));
                    }
                }
            }
        }
    }
    None
}

/// Resolve an explicit date filter. Unrecognized filters fall back to the
/// last seven days.
pub fn resolve_date_filter(filter: &str, today: NaiveDate) -> DateRange {
    extract_date_range(filter, today).unwrap_or_else(|| {
        tracing::warn!(filter, "unrecognized date filter, using last 7 days");
        DateRange::days(today - Duration::days(7), today)
    })
}
