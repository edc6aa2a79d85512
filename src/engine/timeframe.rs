// ── Mnemo Engine: Timeframe Parser ──────────────────────────────────────────
//
// Time-aware recall — find memories by WHEN they were written, not just what
// they contain. Given a natural-language query, extracts a time phrase,
// resolves it to a half-open `[start, end)` window, and returns the query
// with the phrase stripped:
//
//   "what did we discuss last week about PostgreSQL"
//     → query   "what did we discuss about PostgreSQL"
//       phrase  "last week"
//       window  [now − 7 d, now)
//
// Recognized: yesterday / today / recently, last week|month|year, last
// night, this morning|afternoon|evening|week|month, "N units ago" with
// digits or one…ten ("a"/"an" = 1, "couple" = 2, "few" = 3), "in the past N
// units", "since yesterday/today", and weekend expressions ("last weekend",
// "2 weekends ago", "weekend before last") which resolve to
// [Saturday 00:00, Monday 00:00) of the target weekend.
//
// Unknown phrases leave the query untouched with no window. All math is UTC.

use crate::atoms::constants::FEW_QUANTITY;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{TimeFrame, TimeframeExtraction, WeekStart};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

const QTY: &str = r"(\d+|one|two|three|four|five|six|seven|eight|nine|ten|a few|few|a couple of|a couple|couple of|couple|an|a)";

macro_rules! phrase_re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(&format!("(?i){}", $pattern.replace("QTY", QTY))).expect("phrase regex")
        });
    };
}

phrase_re!(RE_WEEKEND_BEFORE_LAST, r"\bweekend before last\b");
phrase_re!(RE_WEEKENDS_AGO, r"\bQTY\s+weekends?\s+ago\b");
phrase_re!(RE_LAST_WEEKEND, r"\blast weekend\b");
phrase_re!(RE_SINCE, r"\bsince\s+(yesterday|today)\b");
phrase_re!(RE_IN_THE_PAST, r"\bin the (?:past|last)\s+(?:QTY\s+)?(minute|hour|day|week|month)s?\b");
phrase_re!(RE_AGO, r"\bQTY\s+(minute|hour|day|week|month|year)s?\s+ago\b");
phrase_re!(RE_LAST_NIGHT, r"\blast night\b");
phrase_re!(RE_LAST_PERIOD, r"\blast\s+(week|month|year)\b");
phrase_re!(RE_THIS_PART_OF_DAY, r"\bthis\s+(morning|afternoon|evening)\b");
phrase_re!(RE_THIS_PERIOD, r"\bthis\s+(week|month)\b");
phrase_re!(RE_YESTERDAY, r"\byesterday\b");
phrase_re!(RE_TODAY, r"\btoday\b");
phrase_re!(RE_RECENTLY, r"\brecently\b");

/// Inputs `normalize` accepts.
#[derive(Debug, Clone)]
pub enum TimeframeValue {
    /// Ready-made half-open range; passed through.
    Range(TimeFrame),
    /// A single instant: everything from that moment on.
    At(DateTime<Utc>),
    /// A calendar date: that whole day.
    Date(NaiveDate),
    /// Parsed as RFC 3339, then as a date, then as a phrase.
    Text(String),
    /// Union of the parts ([min start, max end]).
    Many(Vec<TimeframeValue>),
    /// Extract from the `query` argument; the query is then required.
    Auto,
}

/// Natural-language time window extraction.
#[derive(Debug, Clone, Copy)]
pub struct TimeframeParser {
    week_start: WeekStart,
}

impl TimeframeParser {
    pub fn new(week_start: WeekStart) -> Self {
        Self { week_start }
    }

    /// Extract a time phrase from `query`. Unknown phrases return the query
    /// unchanged with no window.
    pub fn extract(&self, query: &str) -> TimeframeExtraction {
        self.extract_at(query, Utc::now())
    }

    /// `extract` with an injectable clock, used by tests.
    pub fn extract_at(&self, query: &str, now: DateTime<Utc>) -> TimeframeExtraction {
        if let Some((range, window)) = self.match_phrase(query, now) {
            let mut stripped = String::with_capacity(query.len());
            stripped.push_str(&query[..range.0]);
            stripped.push(' ');
            stripped.push_str(&query[range.1..]);
            let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
            TimeframeExtraction {
                query: cleaned,
                timeframe: Some(window),
                extracted: Some(query[range.0..range.1].to_string()),
            }
        } else {
            TimeframeExtraction {
                query: query.to_string(),
                timeframe: None,
                extracted: None,
            }
        }
    }

    /// Normalize any accepted input shape into a window. `Auto` extracts
    /// from `query`, which is then required.
    pub fn normalize(
        &self,
        value: &TimeframeValue,
        query: Option<&str>,
    ) -> EngineResult<Option<TimeFrame>> {
        match value {
            TimeframeValue::Range(tf) => Ok(Some(*tf)),
            TimeframeValue::At(t) => Ok(Some(TimeFrame::new(*t, far_future()))),
            TimeframeValue::Date(d) => {
                let start = day_start(*d);
                Ok(Some(TimeFrame::new(start, start + Duration::days(1))))
            }
            TimeframeValue::Text(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Ok(Some(TimeFrame::new(dt.with_timezone(&Utc), far_future())));
                }
                if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                    let start = day_start(d);
                    return Ok(Some(TimeFrame::new(start, start + Duration::days(1))));
                }
                Ok(self.extract(s).timeframe)
            }
            TimeframeValue::Many(parts) => {
                let mut merged: Option<TimeFrame> = None;
                for part in parts {
                    if let Some(tf) = self.normalize(part, query)? {
                        merged = Some(match merged {
                            None => tf,
                            Some(acc) => TimeFrame::new(
                                acc.start.min(tf.start),
                                acc.end.max(tf.end),
                            ),
                        });
                    }
                }
                Ok(merged)
            }
            TimeframeValue::Auto => {
                let query = query.ok_or_else(|| {
                    EngineError::validation("query", "auto timeframe requires a query")
                })?;
                Ok(self.extract(query).timeframe)
            }
        }
    }

    // ── Phrase matching ─────────────────────────────────────────────────

    /// First matching phrase wins; patterns are ordered most → least
    /// specific so "since yesterday" beats the bare "yesterday".
    fn match_phrase(
        &self,
        query: &str,
        now: DateTime<Utc>,
    ) -> Option<((usize, usize), TimeFrame)> {
        if let Some(m) = RE_WEEKEND_BEFORE_LAST.find(query) {
            return Some(((m.start(), m.end()), weekend_window(now, 2)));
        }
        if let Some(caps) = RE_WEEKENDS_AGO.captures(query) {
            let m = caps.get(0).expect("match");
            let n = parse_quantity(caps.get(1).map_or("", |c| c.as_str())).max(1);
            return Some(((m.start(), m.end()), weekend_window(now, n)));
        }
        if let Some(m) = RE_LAST_WEEKEND.find(query) {
            return Some(((m.start(), m.end()), weekend_window(now, 1)));
        }
        if let Some(caps) = RE_SINCE.captures(query) {
            let m = caps.get(0).expect("match");
            let day = match caps.get(1).map_or("", |c| c.as_str()).to_lowercase().as_str() {
                "yesterday" => day_start(now.date_naive() - Duration::days(1)),
                _ => day_start(now.date_naive()),
            };
            return Some(((m.start(), m.end()), TimeFrame::new(day, now)));
        }
        if let Some(caps) = RE_IN_THE_PAST.captures(query) {
            let m = caps.get(0).expect("match");
            let n = caps.get(1).map_or(1, |c| parse_quantity(c.as_str()));
            let unit = caps.get(2).map_or("", |c| c.as_str());
            let span = unit_duration(unit, n);
            return Some(((m.start(), m.end()), TimeFrame::new(now - span, now)));
        }
        if let Some(caps) = RE_AGO.captures(query) {
            let m = caps.get(0).expect("match");
            let n = parse_quantity(caps.get(1).map_or("", |c| c.as_str()));
            let unit = caps.get(2).map_or("", |c| c.as_str());
            let span = unit_duration(unit, n);
            return Some(((m.start(), m.end()), TimeFrame::new(now - span, now)));
        }
        if let Some(m) = RE_LAST_NIGHT.find(query) {
            let yesterday = day_start(now.date_naive() - Duration::days(1));
            return Some((
                (m.start(), m.end()),
                TimeFrame::new(yesterday + Duration::hours(18), yesterday + Duration::hours(30)),
            ));
        }
        if let Some(caps) = RE_LAST_PERIOD.captures(query) {
            let m = caps.get(0).expect("match");
            let span = match caps.get(1).map_or("", |c| c.as_str()).to_lowercase().as_str() {
                "week" => Duration::days(7),
                "month" => Duration::days(30),
                _ => Duration::days(365),
            };
            return Some(((m.start(), m.end()), TimeFrame::new(now - span, now)));
        }
        if let Some(caps) = RE_THIS_PART_OF_DAY.captures(query) {
            let m = caps.get(0).expect("match");
            let today = day_start(now.date_naive());
            let (from, to) = match caps.get(1).map_or("", |c| c.as_str()).to_lowercase().as_str() {
                "morning" => (6, 12),
                "afternoon" => (12, 18),
                _ => (18, 24),
            };
            return Some((
                (m.start(), m.end()),
                TimeFrame::new(today + Duration::hours(from), today + Duration::hours(to)),
            ));
        }
        if let Some(caps) = RE_THIS_PERIOD.captures(query) {
            let m = caps.get(0).expect("match");
            let start = match caps.get(1).map_or("", |c| c.as_str()).to_lowercase().as_str() {
                "week" => self.start_of_week(now),
                _ => day_start(now.date_naive().with_day(1).expect("first of month")),
            };
            return Some(((m.start(), m.end()), TimeFrame::new(start, now)));
        }
        if let Some(m) = RE_YESTERDAY.find(query) {
            let start = day_start(now.date_naive() - Duration::days(1));
            return Some(((m.start(), m.end()), TimeFrame::new(start, start + Duration::days(1))));
        }
        if let Some(m) = RE_TODAY.find(query) {
            let start = day_start(now.date_naive());
            return Some(((m.start(), m.end()), TimeFrame::new(start, start + Duration::days(1))));
        }
        if let Some(m) = RE_RECENTLY.find(query) {
            return Some((
                (m.start(), m.end()),
                TimeFrame::new(now - Duration::days(FEW_QUANTITY), now),
            ));
        }
        None
    }

    fn start_of_week(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let days_back = match self.week_start {
            WeekStart::Monday => now.weekday().num_days_from_monday(),
            WeekStart::Sunday => now.weekday().num_days_from_sunday(),
        } as i64;
        day_start(now.date_naive() - Duration::days(days_back))
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn day_start(d: NaiveDate) -> DateTime<Utc> {
    d.and_hms_opt(0, 0, 0).expect("midnight").and_utc()
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).single().expect("far future")
}

/// English quantity words one…ten, "a"/"an" = 1, "couple" = 2, "few" = 3.
fn parse_quantity(word: &str) -> i64 {
    let w = word.trim().to_lowercase();
    if let Ok(n) = w.parse::<i64>() {
        return n;
    }
    if w.contains("few") {
        return FEW_QUANTITY;
    }
    if w.contains("couple") {
        return 2;
    }
    match w.as_str() {
        "one" | "a" | "an" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        _ => 1,
    }
}

fn unit_duration(unit: &str, n: i64) -> Duration {
    match unit.to_lowercase().as_str() {
        "minute" => Duration::minutes(n),
        "hour" => Duration::hours(n),
        "day" => Duration::days(n),
        "week" => Duration::days(7 * n),
        "month" => Duration::days(30 * n),
        _ => Duration::days(365 * n),
    }
}

/// `[Saturday 00:00, Monday 00:00)` of the weekend `n` back. A weekend still
/// in progress counts as "this weekend", so `n = 1` is the last completed one.
fn weekend_window(now: DateTime<Utc>, n: i64) -> TimeFrame {
    let days_since_saturday =
        (now.weekday().num_days_from_monday() as i64 + 7 - 5).rem_euclid(7);
    let most_recent_saturday = day_start(now.date_naive() - Duration::days(days_since_saturday));
    let in_progress = now < most_recent_saturday + Duration::days(2);
    let last_completed = if in_progress {
        most_recent_saturday - Duration::days(7)
    } else {
        most_recent_saturday
    };
    let start = last_completed - Duration::days(7 * (n - 1));
    TimeFrame::new(start, start + Duration::days(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn parser() -> TimeframeParser {
        TimeframeParser::new(WeekStart::Monday)
    }

    /// A fixed Wednesday noon so weekend math is deterministic.
    fn wednesday_noon() -> DateTime<Utc> {
        let t = Utc.with_ymd_and_hms(2025, 6, 18, 12, 0, 0).single().unwrap();
        assert_eq!(t.weekday(), Weekday::Wed);
        t
    }

    #[test]
    fn test_last_week_strips_phrase() {
        let now = wednesday_noon();
        let out = parser().extract_at("what did we discuss last week about PostgreSQL", now);
        assert_eq!(out.query, "what did we discuss about PostgreSQL");
        assert_eq!(out.extracted.as_deref(), Some("last week"));
        let tf = out.timeframe.unwrap();
        assert_eq!(tf.start, now - Duration::days(7));
        assert_eq!(tf.end, now);
    }

    #[test]
    fn test_unknown_phrase_is_untouched() {
        let out = parser().extract_at("show me notes about PostgreSQL", wednesday_noon());
        assert_eq!(out.query, "show me notes about PostgreSQL");
        assert!(out.timeframe.is_none());
        assert!(out.extracted.is_none());
    }

    #[test]
    fn test_yesterday_is_a_full_day() {
        let now = wednesday_noon();
        let out = parser().extract_at("notes from yesterday", now);
        let tf = out.timeframe.unwrap();
        assert_eq!(tf.start, Utc.with_ymd_and_hms(2025, 6, 17, 0, 0, 0).single().unwrap());
        assert_eq!(tf.end - tf.start, Duration::days(1));
        assert_eq!(out.query, "notes from");
    }

    #[test]
    fn test_since_yesterday_beats_yesterday() {
        let now = wednesday_noon();
        let out = parser().extract_at("everything since yesterday", now);
        assert_eq!(out.extracted.as_deref(), Some("since yesterday"));
        let tf = out.timeframe.unwrap();
        assert_eq!(tf.start, Utc.with_ymd_and_hms(2025, 6, 17, 0, 0, 0).single().unwrap());
        assert_eq!(tf.end, now);
    }

    #[test]
    fn test_number_words() {
        let now = wednesday_noon();
        let out = parser().extract_at("what broke three days ago", now);
        let tf = out.timeframe.unwrap();
        assert_eq!(tf.start, now - Duration::days(3));

        let out = parser().extract_at("deployed 2 hours ago", now);
        assert_eq!(out.timeframe.unwrap().start, now - Duration::hours(2));
    }

    #[test]
    fn test_few_expands_to_three() {
        let now = wednesday_noon();
        let out = parser().extract_at("what happened a few days ago", now);
        assert_eq!(out.timeframe.unwrap().start, now - Duration::days(3));

        let out = parser().extract_at("in the past few hours", now);
        assert_eq!(out.timeframe.unwrap().start, now - Duration::hours(3));
        assert_eq!(out.query, "");
    }

    #[test]
    fn test_last_weekend_window() {
        // Wed Jun 18 2025 → last weekend is Sat Jun 14 00:00 – Mon Jun 16 00:00.
        let out = parser().extract_at("the incident last weekend", wednesday_noon());
        let tf = out.timeframe.unwrap();
        assert_eq!(tf.start, Utc.with_ymd_and_hms(2025, 6, 14, 0, 0, 0).single().unwrap());
        assert_eq!(tf.end, Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).single().unwrap());
        assert_eq!(tf.start.weekday(), Weekday::Sat);
        assert_eq!(tf.end.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_two_weekends_ago() {
        let out = parser().extract_at("2 weekends ago", wednesday_noon());
        let tf = out.timeframe.unwrap();
        assert_eq!(tf.start, Utc.with_ymd_and_hms(2025, 6, 7, 0, 0, 0).single().unwrap());

        // "weekend before last" is the same window.
        let alias = parser().extract_at("weekend before last", wednesday_noon());
        assert_eq!(alias.timeframe.unwrap(), tf);
    }

    #[test]
    fn test_weekend_in_progress_counts_as_this_weekend() {
        // Sunday noon: "last weekend" must be the previous one.
        let sunday = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).single().unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);
        let tf = parser().extract_at("last weekend", sunday).timeframe.unwrap();
        assert_eq!(tf.start, Utc.with_ymd_and_hms(2025, 6, 7, 0, 0, 0).single().unwrap());
    }

    #[test]
    fn test_this_week_honors_week_start() {
        let now = wednesday_noon();
        let monday = TimeframeParser::new(WeekStart::Monday)
            .extract_at("this week", now)
            .timeframe
            .unwrap();
        assert_eq!(monday.start.weekday(), Weekday::Mon);

        let sunday = TimeframeParser::new(WeekStart::Sunday)
            .extract_at("this week", now)
            .timeframe
            .unwrap();
        assert_eq!(sunday.start.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_this_morning() {
        let now = wednesday_noon();
        let tf = parser().extract_at("what did I note this morning", now).timeframe.unwrap();
        assert_eq!(tf.start, Utc.with_ymd_and_hms(2025, 6, 18, 6, 0, 0).single().unwrap());
        assert_eq!(tf.end, Utc.with_ymd_and_hms(2025, 6, 18, 12, 0, 0).single().unwrap());
    }

    #[test]
    fn test_recently() {
        let now = wednesday_noon();
        let tf = parser().extract_at("recently discussed topics", now).timeframe.unwrap();
        assert_eq!(tf.start, now - Duration::days(3));
    }

    #[test]
    fn test_normalize_shapes() {
        let p = parser();
        let now = Utc::now();

        let range = TimeFrame::new(now - Duration::days(1), now);
        assert_eq!(p.normalize(&TimeframeValue::Range(range), None).unwrap(), Some(range));

        let at = p.normalize(&TimeframeValue::At(now), None).unwrap().unwrap();
        assert_eq!(at.start, now);
        assert!(at.end > now + Duration::days(365));

        let date = NaiveDate::from_ymd_opt(2025, 6, 18).unwrap();
        let day = p.normalize(&TimeframeValue::Date(date), None).unwrap().unwrap();
        assert_eq!(day.end - day.start, Duration::days(1));

        let text = p
            .normalize(&TimeframeValue::Text("2025-06-18".into()), None)
            .unwrap()
            .unwrap();
        assert_eq!(text, day);

        let phrase = p.normalize(&TimeframeValue::Text("yesterday".into()), None).unwrap();
        assert!(phrase.is_some());

        let many = p
            .normalize(
                &TimeframeValue::Many(vec![
                    TimeframeValue::Date(date),
                    TimeframeValue::Date(date + Duration::days(3)),
                ]),
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(many.end - many.start, Duration::days(4));
    }

    #[test]
    fn test_normalize_auto_requires_query() {
        let p = parser();
        assert!(p.normalize(&TimeframeValue::Auto, None).is_err());
        let tf = p
            .normalize(&TimeframeValue::Auto, Some("what happened yesterday"))
            .unwrap();
        assert!(tf.is_some());
    }
}
