//! Recurrence rules and the occurrence calculator.
//!
//! Rules are a subset of RFC 5545 RRULE strings, e.g. `FREQ=MONTHLY;BYMONTHDAY=1`
//! or `FREQ=MONTHLY;BYMONTHDAY=15,-1`, optionally preceded by a `DTSTART:` line
//! that pins the interval phase:
//!
//! ```text
//! DTSTART:20240105T000000Z
//! RRULE:FREQ=WEEKLY;INTERVAL=2;BYDAY=FR
//! ```
//!
//! Occurrences are calendar days. Each one lands on local midnight of that day
//! in the account's timezone, so "the 1st of the month" stays the 1st across
//! daylight-saving transitions.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use fundflow_core::{DomainError, DomainResult};

/// Upper bound on recurrence periods scanned for a single lookup.
const MAX_PERIODS: i64 = 2_000;

/// Upper bound on occurrences walked when counting events in a window.
const MAX_COUNTED_OCCURRENCES: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl FromStr for Frequency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            other => Err(DomainError::invalid_rule(format!("unsupported FREQ: {other}"))),
        }
    }
}

/// A date value inside a rule (`DTSTART` / `UNTIL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleDate {
    /// Floating calendar date, interpreted in the account timezone.
    Date(NaiveDate),
    /// Absolute instant (`...Z` form).
    Instant(DateTime<Utc>),
}

impl RuleDate {
    fn parse(value: &str) -> DomainResult<Self> {
        let value = value.trim();
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
            return Ok(Self::Date(date));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ") {
            return Ok(Self::Instant(dt.and_utc()));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
            return Ok(Self::Date(dt.date()));
        }
        Err(DomainError::invalid_rule(format!("malformed date: {value}")))
    }

    fn local_date(&self, tz: Tz) -> NaiveDate {
        match self {
            Self::Date(date) => *date,
            Self::Instant(instant) => instant.with_timezone(&tz).date_naive(),
        }
    }

    fn as_bound(&self, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(date) => local_midnight(*date, tz),
            Self::Instant(instant) => Some(*instant),
        }
    }
}

/// Parsed recurrence rule. Keeps the source text for storage and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecurrenceRule {
    raw: String,
    frequency: Frequency,
    interval: u32,
    by_day: Vec<Weekday>,
    by_month_day: Vec<i32>,
    by_month: Vec<u32>,
    until: Option<RuleDate>,
    dtstart: Option<RuleDate>,
}

impl RecurrenceRule {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Last instant an occurrence may fall on, if the rule carries `UNTIL`.
    pub fn until(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.until.and_then(|until| until.as_bound(tz))
    }

    /// First occurrence strictly after `after`.
    ///
    /// `anchor` fixes the interval phase and supplies the defaults for parts the
    /// rule leaves out (weekday, day of month, month). A `DTSTART` in the rule
    /// takes precedence over it. Returns `None` once the rule is exhausted.
    pub fn next_after(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        let anchor_date = match self.dtstart {
            Some(start) => start.local_date(tz),
            None => anchor.with_timezone(&tz).date_naive(),
        };
        let after_date = after.with_timezone(&tz).date_naive();
        let until = self.until(tz);

        let interval = i64::from(self.interval);
        let elapsed = self.units_between(anchor_date, after_date);
        let first_step = (elapsed / interval - 1).max(0);

        for step in first_step..first_step + MAX_PERIODS {
            for date in self.period_dates(anchor_date, step * interval)? {
                if date < anchor_date {
                    continue;
                }
                let instant = local_midnight(date, tz)?;
                if until.is_some_and(|until| instant > until) {
                    return None;
                }
                if instant > after {
                    return Some(instant);
                }
            }
        }

        None
    }

    /// Number of occurrences in `[first, last]`, treating `first` itself as one.
    pub fn count_between(
        &self,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        tz: Tz,
    ) -> u32 {
        if first > last {
            return 0;
        }

        let mut count = 1;
        let mut cursor = first;
        while count < MAX_COUNTED_OCCURRENCES {
            match self.next_after(first, cursor, tz) {
                Some(next) if next <= last => {
                    count += 1;
                    cursor = next;
                }
                _ => break,
            }
        }
        count
    }

    /// Whole periods between the anchor and `date` (may be negative).
    fn units_between(&self, anchor: NaiveDate, date: NaiveDate) -> i64 {
        match self.frequency {
            Frequency::Daily => (date - anchor).num_days(),
            Frequency::Weekly => (week_start(date) - week_start(anchor)).num_days() / 7,
            Frequency::Monthly => month_index(date) - month_index(anchor),
            Frequency::Yearly => i64::from(date.year()) - i64::from(anchor.year()),
        }
    }

    /// Candidate dates of the period `offset` units after the anchor's, ascending.
    fn period_dates(&self, anchor: NaiveDate, offset: i64) -> Option<Vec<NaiveDate>> {
        let offset_u = u64::try_from(offset).ok()?;
        let mut dates = match self.frequency {
            Frequency::Daily => vec![anchor.checked_add_days(Days::new(offset_u))?],
            Frequency::Weekly => {
                let start = week_start(anchor).checked_add_days(Days::new(offset_u * 7))?;
                let days: Vec<Weekday> = if self.by_day.is_empty() {
                    vec![anchor.weekday()]
                } else {
                    self.by_day.clone()
                };
                days.into_iter()
                    .filter_map(|day| {
                        start.checked_add_days(Days::new(u64::from(day.num_days_from_monday())))
                    })
                    .collect()
            }
            Frequency::Monthly => {
                let total = month_index(anchor) + offset;
                let year = i32::try_from(total.div_euclid(12)).ok()?;
                let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
                self.month_days(year, month, anchor)
            }
            Frequency::Yearly => {
                let year = anchor.year().checked_add(i32::try_from(offset).ok()?)?;
                let months = if self.by_month.is_empty() {
                    vec![anchor.month()]
                } else {
                    self.by_month.clone()
                };
                months
                    .into_iter()
                    .flat_map(|month| self.month_days(year, month, anchor))
                    .collect()
            }
        };

        dates.sort_unstable();
        dates.dedup();
        Some(dates)
    }

    fn month_days(&self, year: i32, month: u32, anchor: NaiveDate) -> Vec<NaiveDate> {
        let Some(len) = days_in_month(year, month) else {
            return Vec::new();
        };
        let wanted: Vec<i32> = if self.by_month_day.is_empty() {
            vec![anchor.day() as i32]
        } else {
            self.by_month_day.clone()
        };

        wanted
            .into_iter()
            .filter_map(|day| {
                let resolved = if day > 0 { day } else { len as i32 + day + 1 };
                if resolved < 1 || resolved > len as i32 {
                    return None;
                }
                NaiveDate::from_ymd_opt(year, month, resolved as u32)
            })
            .collect()
    }
}

impl FromStr for RecurrenceRule {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(DomainError::invalid_rule("empty rule"));
        }

        let mut dtstart = None;
        let mut body = None;
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(value) = line.strip_prefix("DTSTART") {
                let value = value.strip_prefix(':').ok_or_else(|| {
                    DomainError::invalid_rule("DTSTART parameters are not supported")
                })?;
                dtstart = Some(RuleDate::parse(value)?);
                continue;
            }
            if body.is_some() {
                return Err(DomainError::invalid_rule("multiple RRULE lines"));
            }
            body = Some(line.strip_prefix("RRULE:").unwrap_or(line));
        }
        let body = body.ok_or_else(|| DomainError::invalid_rule("missing RRULE"))?;

        let mut frequency = None;
        let mut interval = 1;
        let mut by_day = Vec::new();
        let mut by_month_day = Vec::new();
        let mut by_month = Vec::new();
        let mut until = None;

        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| DomainError::invalid_rule(format!("malformed part: {part}")))?;
            match key.to_ascii_uppercase().as_str() {
                "FREQ" => frequency = Some(value.to_ascii_uppercase().parse::<Frequency>()?),
                "INTERVAL" => {
                    interval = value
                        .parse::<u32>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| DomainError::invalid_rule(format!("bad INTERVAL: {value}")))?;
                }
                "BYDAY" => {
                    by_day = split_list(value)
                        .map(parse_weekday)
                        .collect::<DomainResult<Vec<_>>>()?;
                }
                "BYMONTHDAY" => {
                    by_month_day = split_list(value)
                        .map(|v| {
                            v.parse::<i32>()
                                .ok()
                                .filter(|d| *d != 0 && (-31..=31).contains(d))
                                .ok_or_else(|| {
                                    DomainError::invalid_rule(format!("bad BYMONTHDAY: {v}"))
                                })
                        })
                        .collect::<DomainResult<Vec<_>>>()?;
                }
                "BYMONTH" => {
                    by_month = split_list(value)
                        .map(|v| {
                            v.parse::<u32>()
                                .ok()
                                .filter(|m| (1..=12).contains(m))
                                .ok_or_else(|| DomainError::invalid_rule(format!("bad BYMONTH: {v}")))
                        })
                        .collect::<DomainResult<Vec<_>>>()?;
                }
                "UNTIL" => until = Some(RuleDate::parse(value)?),
                "WKST" => {}
                other => {
                    return Err(DomainError::invalid_rule(format!("unsupported part: {other}")));
                }
            }
        }

        let frequency = frequency.ok_or_else(|| DomainError::invalid_rule("missing FREQ"))?;

        if !by_day.is_empty() && frequency != Frequency::Weekly {
            return Err(DomainError::invalid_rule("BYDAY is only supported with FREQ=WEEKLY"));
        }
        if !by_month_day.is_empty()
            && !matches!(frequency, Frequency::Monthly | Frequency::Yearly)
        {
            return Err(DomainError::invalid_rule(
                "BYMONTHDAY is only supported with FREQ=MONTHLY or FREQ=YEARLY",
            ));
        }
        if !by_month.is_empty() && frequency != Frequency::Yearly {
            return Err(DomainError::invalid_rule("BYMONTH is only supported with FREQ=YEARLY"));
        }

        Ok(Self {
            raw: raw.to_string(),
            frequency,
            interval,
            by_day,
            by_month_day,
            by_month,
            until,
            dtstart,
        })
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for RecurrenceRule {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecurrenceRule> for String {
    fn from(rule: RecurrenceRule) -> Self {
        rule.raw
    }
}

/// Result of checking a stored occurrence against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// Advanced occurrence when due, otherwise the unchanged stored one.
    pub next: DateTime<Utc>,
    /// Whether the stored occurrence had arrived (`current <= now`).
    pub is_due: bool,
}

/// Recurrence calculator.
///
/// When `current <= now` the occurrence is due and `next` is the first rule
/// occurrence strictly after `now` (and therefore after `current`). Otherwise
/// nothing advances and `is_due` is false; callers must not persist anything.
pub fn next_occurrence(
    rule: &RecurrenceRule,
    current: DateTime<Utc>,
    now: DateTime<Utc>,
    tz: Tz,
) -> DomainResult<Occurrence> {
    if current > now {
        return Ok(Occurrence {
            next: current,
            is_due: false,
        });
    }

    let next = rule.next_after(current, now, tz).ok_or_else(|| {
        DomainError::invalid_rule(format!("rule {rule} has no occurrence after {now}"))
    })?;

    if next <= current {
        return Err(DomainError::invariant(format!(
            "recurrence did not advance: {current} -> {next}"
        )));
    }

    Ok(Occurrence {
        next,
        is_due: true,
    })
}

/// Local midnight of `date` in `tz`, as an instant.
///
/// Ambiguous midnights resolve to the earlier instant. When midnight falls in a
/// DST gap the first existing hour of the day is used.
pub(crate) fn local_midnight(date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    (0..=3).find_map(|hour| {
        let naive = date.and_hms_opt(hour, 0, 0)?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn parse_weekday(value: &str) -> DomainResult<Weekday> {
    match value.to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(DomainError::invalid_rule(format!("unsupported BYDAY value: {other}"))),
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year.checked_add(1)?, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|last| last.day())
}
