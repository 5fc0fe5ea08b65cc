//! Interval specifications on computation parameters.
//!
//! Accepts one or more `<count><unit>` increments separated by spaces or
//! commas (`1Hour`, `15Minutes`, `1Day 6Hours`). Units are matched by
//! prefix. A leading `~` marks a local-regular interval and `0` an
//! irregular one.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl CalendarUnit {
    /// Map a unit word to a calendar unit by prefix.
    fn from_word(word: &str) -> Option<Self> {
        let w = word.to_ascii_lowercase();
        let unit = if w.starts_with('s') {
            CalendarUnit::Second
        } else if w.starts_with("mi") {
            CalendarUnit::Minute
        } else if w.starts_with('h') {
            CalendarUnit::Hour
        } else if w.starts_with('d') {
            CalendarUnit::Day
        } else if w.starts_with('w') {
            CalendarUnit::Week
        } else if w.starts_with("mo") || w.starts_with("me") {
            CalendarUnit::Month
        } else if w.starts_with('y') || w.starts_with("an") {
            CalendarUnit::Year
        } else if w.starts_with('m') {
            // A bare "m" is a minute.
            CalendarUnit::Minute
        } else {
            return None;
        };
        Some(unit)
    }

    fn abbrev(self) -> &'static str {
        match self {
            CalendarUnit::Second => "SEC",
            CalendarUnit::Minute => "MIN",
            CalendarUnit::Hour => "HR",
            CalendarUnit::Day => "DAY",
            CalendarUnit::Week => "WK",
            CalendarUnit::Month => "MON",
            CalendarUnit::Year => "YR",
        }
    }
}

/// A parsed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interval {
    Irregular,
    Regular {
        increments: Vec<(u32, CalendarUnit)>,
        local: bool,
    },
}

fn increment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+)\s*([a-zA-Z]+)[\s,]*").expect("interval pattern is a valid regex")
    })
}

impl Interval {
    pub fn parse(spec: &str) -> CoreResult<Self> {
        let invalid = |reason: &str| CoreError::InvalidInterval {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = spec.trim();
        if trimmed == "0" {
            return Ok(Interval::Irregular);
        }
        let (local, body) = match trimmed.strip_prefix('~') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };

        let mut increments = Vec::new();
        let mut consumed = 0;
        for caps in increment_pattern().captures_iter(body) {
            let whole = caps.get(0).ok_or_else(|| invalid("no match"))?;
            if whole.start() != consumed {
                return Err(invalid("unexpected text between increments"));
            }
            consumed = whole.end();

            let count: u32 = caps[1].parse().map_err(|_| invalid("count out of range"))?;
            let unit = CalendarUnit::from_word(&caps[2])
                .ok_or_else(|| invalid(&format!("unknown unit '{}'", &caps[2])))?;
            increments.push((count, unit));
        }

        if increments.is_empty() {
            return Err(invalid("no increments found"));
        }
        if consumed != body.len() {
            return Err(invalid("trailing text"));
        }
        Ok(Interval::Regular { increments, local })
    }

    pub fn is_irregular(&self) -> bool {
        matches!(self, Interval::Irregular)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Irregular => f.write_str("(IRREGULAR)"),
            Interval::Regular { increments, local } => {
                if *local {
                    f.write_str("~")?;
                }
                for (count, unit) in increments {
                    write!(f, "({count} {})", unit.abbrev())?;
                }
                Ok(())
            }
        }
    }
}
