//! Command text to calendar date ranges.
//!
//! Grammar, always relative to `today`'s year and month:
//!
//! | text                         | range                                   |
//! |------------------------------|-----------------------------------------|
//! | `first-half`, `上半個月`     | day 1 to day 15                         |
//! | `second-half`, `下半個月`    | day 16 to the last day of the month     |
//! | `MMDD MMDD`                  | explicit start and end, start <= end    |
//! | `MMDD`                       | one day                                 |
//!
//! `MMDD` only checks `1..=12` and `1..=31`.  A day past the end of its month
//! carries into the next one (`0231` is March 2nd or 3rd), matching what the
//! portal users have always typed and seen.

use std::fmt;
use std::sync::LazyLock;

use chrono::{Datelike, Days, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

static RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{4})\s+([0-9]{4})$").expect("valid range regex"));
static SINGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{4})$").expect("valid single-day regex"));

const FIRST_HALF: [&str; 2] = ["first-half", "上半個月"];
const SECOND_HALF: [&str; 2] = ["second-half", "下半個月"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    ExactRange,
    FirstHalfOfMonth,
    SecondHalfOfMonth,
}

/// Inclusive calendar range with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Separator-free `YYYYMMDD` pair, the form the sales page inputs take.
    pub fn digits(&self) -> (String, String) {
        (
            self.start.format("%Y%m%d").to_string(),
            self.end.format("%Y%m%d").to_string(),
        )
    }

    /// `MM/DD` for a single day, `MM/DD - MM/DD` otherwise.
    pub fn label(&self) -> String {
        let start = self.start.format("%m/%d");
        if self.start == self.end {
            start.to_string()
        } else {
            format!("{start} - {}", self.end.format("%m/%d"))
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedQuery {
    pub range: DateRange,
    pub kind: QueryKind,
}

/// Parse a command; `None` when it matches no form.
pub fn resolve(text: &str, today: NaiveDate) -> Option<ResolvedQuery> {
    let text = text.trim();
    let (year, month) = (today.year(), today.month());

    if FIRST_HALF.contains(&text) {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let end = NaiveDate::from_ymd_opt(year, month, 15)?;
        return Some(ResolvedQuery {
            range: DateRange::new(start, end)?,
            kind: QueryKind::FirstHalfOfMonth,
        });
    }

    if SECOND_HALF.contains(&text) {
        let start = NaiveDate::from_ymd_opt(year, month, 16)?;
        let end = last_day_of_month(year, month)?;
        return Some(ResolvedQuery {
            range: DateRange::new(start, end)?,
            kind: QueryKind::SecondHalfOfMonth,
        });
    }

    // A reversed pair is rejected outright; it never degrades to one day.
    if let Some(caps) = RANGE.captures(text) {
        let start = month_day(&caps[1], year)?;
        let end = month_day(&caps[2], year)?;
        return DateRange::new(start, end).map(|range| ResolvedQuery {
            range,
            kind: QueryKind::ExactRange,
        });
    }

    if let Some(caps) = SINGLE.captures(text) {
        let day = month_day(&caps[1], year)?;
        return Some(ResolvedQuery {
            range: DateRange::single(day),
            kind: QueryKind::ExactRange,
        });
    }

    None
}

/// `MMDD` in `year`; days beyond the month's length carry forward.
fn month_day(mmdd: &str, year: i32) -> Option<NaiveDate> {
    let month: u32 = mmdd.get(0..2)?.parse().ok()?;
    let day: u64 = mmdd.get(2..4)?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, 1)?.checked_add_days(Days::new(day - 1))
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// What to query after an achievement on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// PV accumulated since the day after the achievement, up to today.
    Due(DateRange),
    /// The achievement is today (or later); nothing has accumulated yet.
    NotYet { start: NaiveDate },
}

pub fn follow_up(achieved: NaiveDate, today: NaiveDate) -> FollowUp {
    let Some(start) = achieved.succ_opt() else {
        return FollowUp::NotYet { start: achieved };
    };
    match DateRange::new(start, today) {
        Some(range) => FollowUp::Due(range),
        None => FollowUp::NotYet { start },
    }
}
