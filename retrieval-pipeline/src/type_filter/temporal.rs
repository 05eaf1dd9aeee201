//! Small rule-based parser turning time phrases ("yesterday", "last 7 days",
//! "5 march", "2024-01-10") into an inclusive UTC range.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

/// Inclusive bounds, both at millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Whole days, from the first millisecond of `first` to the last of `last`.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            from: start_of(first),
            to: end_of(last),
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }
}

const ITALIAN_MONTHS: [(&str, &str); 12] = [
    ("gennaio", "january"),
    ("febbraio", "february"),
    ("marzo", "march"),
    ("aprile", "april"),
    ("maggio", "may"),
    ("giugno", "june"),
    ("luglio", "july"),
    ("agosto", "august"),
    ("settembre", "september"),
    ("ottobre", "october"),
    ("novembre", "november"),
    ("dicembre", "december"),
];

const SPANISH_MONTHS: [(&str, &str); 12] = [
    ("enero", "january"),
    ("febrero", "february"),
    ("marzo", "march"),
    ("abril", "april"),
    ("mayo", "may"),
    ("junio", "june"),
    ("julio", "july"),
    ("agosto", "august"),
    ("septiembre", "september"),
    ("octubre", "october"),
    ("noviembre", "november"),
    ("diciembre", "december"),
];

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Month names that are also common English words; they only count as dates
/// next to a day, a year or a preposition.
const AMBIGUOUS_MONTHS: [&str; 2] = ["may", "march"];

const MONTH_PREPOSITIONS: [&str; 8] = ["in", "during", "of", "since", "en", "di", "a", "de"];

/// Parses every time mention in `text` relative to `now`; several mentions
/// expand to `[earliest start, latest end]`.
pub fn parse_time_range(text: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    if text.trim().is_empty() {
        return None;
    }

    let tokens = tokenize(text);
    let today = now.date_naive();

    relative_ranges(&tokens, today)
        .into_iter()
        .chain(iso_dates(text))
        .chain(month_mentions(&tokens, today))
        .reduce(TimeRange::merge)
}

/// Lowercased alphanumeric words with Italian and Spanish month names mapped to English.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| {
            ITALIAN_MONTHS
                .iter()
                .chain(SPANISH_MONTHS.iter())
                .find(|(local, _)| *local == token)
                .map_or_else(|| token.to_string(), |(_, english)| (*english).to_string())
        })
        .collect()
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

fn end_of(day: NaiveDate) -> DateTime<Utc> {
    start_of(day) + Duration::milliseconds(86_399_999)
}

fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
    Some((first, last))
}

fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
}

fn parse_count(token: &str) -> Option<u32> {
    if let Ok(n) = token.parse::<u32>() {
        return (n > 0).then_some(n);
    }
    let n = match token {
        "a" | "an" | "one" => 1,
        "two" | "couple" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        _ => return None,
    };
    Some(n)
}

fn days_back(today: NaiveDate, count: u32, unit: &str) -> Option<NaiveDate> {
    match unit {
        "day" | "days" => today.checked_sub_signed(Duration::days(i64::from(count))),
        "week" | "weeks" => today.checked_sub_signed(Duration::weeks(i64::from(count))),
        "month" | "months" => today.checked_sub_months(Months::new(count)),
        "year" | "years" => today.checked_sub_months(Months::new(count.checked_mul(12)?)),
        _ => None,
    }
}

fn relative_ranges(tokens: &[String], today: NaiveDate) -> Vec<TimeRange> {
    let mut ranges = Vec::new();
    let at = |i: usize| tokens.get(i).map(String::as_str);

    for (i, token) in tokens.iter().enumerate() {
        let next = at(i + 1);
        let range = match (token.as_str(), next) {
            ("today", _) => Some(TimeRange::days(today, today)),
            ("yesterday", _) => today
                .pred_opt()
                .map(|day| TimeRange::days(day, day)),
            ("this" | "current", Some("week")) => Some(TimeRange::days(week_start(today), today)),
            ("last" | "previous", Some("week")) => {
                let this_week = week_start(today);
                this_week.checked_sub_signed(Duration::days(7)).and_then(|start| {
                    this_week
                        .pred_opt()
                        .map(|end| TimeRange::days(start, end))
                })
            }
            ("this" | "current", Some("month")) => {
                month_bounds(today.year(), today.month()).map(|(first, _)| TimeRange::days(first, today))
            }
            ("last" | "previous", Some("month")) => today
                .checked_sub_months(Months::new(1))
                .and_then(|day| month_bounds(day.year(), day.month()))
                .map(|(first, last)| TimeRange::days(first, last)),
            ("this" | "current", Some("year")) => NaiveDate::from_ymd_opt(today.year(), 1, 1)
                .map(|first| TimeRange::days(first, today)),
            ("last" | "previous", Some("year")) => {
                let year = today.year() - 1;
                NaiveDate::from_ymd_opt(year, 1, 1)
                    .zip(NaiveDate::from_ymd_opt(year, 12, 31))
                    .map(|(first, last)| TimeRange::days(first, last))
            }
            ("past", Some(unit @ ("week" | "month" | "year"))) => {
                days_back(today, 1, unit).map(|start| TimeRange::days(start, today))
            }
            ("last" | "past", Some(count)) => parse_count(count)
                .zip(at(i + 2))
                .and_then(|(n, unit)| days_back(today, n, unit))
                .map(|start| TimeRange::days(start, today)),
            (count, Some(unit)) if at(i + 2) == Some("ago") => parse_count(count)
                .and_then(|n| days_back(today, n, unit))
                .map(|day| TimeRange::days(day, day)),
            _ => None,
        };
        ranges.extend(range);
    }

    ranges
}

fn iso_dates(text: &str) -> Vec<TimeRange> {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .filter_map(|word| NaiveDate::parse_from_str(word, "%Y-%m-%d").ok())
        .map(|day| TimeRange::days(day, day))
        .collect()
}

fn parse_day(token: &str) -> Option<u32> {
    let digits = ["st", "nd", "rd", "th"]
        .iter()
        .find_map(|suffix| token.strip_suffix(suffix))
        .unwrap_or(token);
    digits
        .parse::<u32>()
        .ok()
        .filter(|day| (1..=31).contains(day))
}

fn parse_year(token: &str) -> Option<i32> {
    if token.len() != 4 {
        return None;
    }
    token
        .parse::<i32>()
        .ok()
        .filter(|year| (1900..=2100).contains(year))
}

fn month_mentions(tokens: &[String], today: NaiveDate) -> Vec<TimeRange> {
    let at = |i: Option<usize>| i.and_then(|i| tokens.get(i)).map(String::as_str);
    let mut ranges = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let Some(month) = MONTHS.iter().position(|m| m == token) else {
            continue;
        };
        let month = u32::try_from(month).unwrap_or(0) + 1;
        let prev = at(i.checked_sub(1));

        let day_after = at(Some(i + 1)).and_then(parse_day);
        let day_before = prev.and_then(parse_day).or_else(|| {
            // "5th of march", "5 de marzo"
            prev.filter(|p| MONTH_PREPOSITIONS.contains(p))
                .and(at(i.checked_sub(2)))
                .and_then(parse_day)
        });
        let day = day_after.or(day_before);
        let year_index = if day_after.is_some() { i + 2 } else { i + 1 };
        let year = at(Some(year_index)).and_then(parse_year);

        let anchored = day.is_some()
            || year.is_some()
            || prev.is_some_and(|p| MONTH_PREPOSITIONS.contains(&p));
        if AMBIGUOUS_MONTHS.contains(&token.as_str()) && !anchored {
            continue;
        }

        let resolve = |year: i32| -> Option<TimeRange> {
            match day {
                Some(day) => {
                    NaiveDate::from_ymd_opt(year, month, day).map(|d| TimeRange::days(d, d))
                }
                None => month_bounds(year, month).map(|(first, last)| TimeRange::days(first, last)),
            }
        };

        let range = match year {
            Some(year) => resolve(year),
            // Without a year, a month still ahead of today means last year's.
            None => resolve(today.year()).and_then(|range| {
                if range.from > end_of(today) {
                    resolve(today.year() - 1)
                } else {
                    Some(range)
                }
            }),
        };
        ranges.extend(range);
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        // Saturday
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn yesterday_is_the_previous_utc_day() {
        let range = parse_time_range("what did I do yesterday", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2024, 6, 14), day(2024, 6, 14)));
        assert_eq!(range.to, Utc.with_ymd_and_hms(2024, 6, 14, 23, 59, 59).unwrap() + Duration::milliseconds(999));
    }

    #[test]
    fn last_n_days_ends_today() {
        let range = parse_time_range("PRs merged in the last 7 days", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2024, 6, 8), day(2024, 6, 15)));

        let words = parse_time_range("songs from the past three weeks", now()).expect("range");
        assert_eq!(words, TimeRange::days(day(2024, 5, 25), day(2024, 6, 15)));
    }

    #[test]
    fn last_week_is_the_previous_calendar_week() {
        let range = parse_time_range("meetings last week", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2024, 6, 3), day(2024, 6, 9)));
    }

    #[test]
    fn n_days_ago_is_a_single_day() {
        let range = parse_time_range("the email from 2 days ago", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2024, 6, 13), day(2024, 6, 13)));
    }

    #[test]
    fn month_alone_expands_to_whole_month() {
        let range = parse_time_range("songs I played in april", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2024, 4, 1), day(2024, 4, 30)));
    }

    #[test]
    fn future_month_without_year_resolves_to_last_year() {
        let range = parse_time_range("what happened in december", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2023, 12, 1), day(2023, 12, 31)));
    }

    #[test]
    fn localized_month_names_are_understood() {
        let italian = parse_time_range("riunioni del 5 marzo", now()).expect("range");
        assert_eq!(italian, TimeRange::days(day(2024, 3, 5), day(2024, 3, 5)));

        let spanish = parse_time_range("correos de enero 2023", now()).expect("range");
        assert_eq!(spanish, TimeRange::days(day(2023, 1, 1), day(2023, 1, 31)));
    }

    #[test]
    fn multiple_dates_span_earliest_to_latest() {
        let range =
            parse_time_range("commits between 2024-01-10 and 2024-02-02", now()).expect("range");
        assert_eq!(range, TimeRange::days(day(2024, 1, 10), day(2024, 2, 2)));

        let months = parse_time_range("from march 3rd to april 2", now()).expect("range");
        assert_eq!(months, TimeRange::days(day(2024, 3, 3), day(2024, 4, 2)));
    }

    #[test]
    fn ambiguous_month_words_need_an_anchor() {
        assert!(parse_time_range("may I see my playlists", now()).is_none());
        assert!(parse_time_range("hello world", now()).is_none());
        assert!(parse_time_range("", now()).is_none());
        assert!(parse_time_range("tracks from may 2023", now()).is_some());
    }
}
