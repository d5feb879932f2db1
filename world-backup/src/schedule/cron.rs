//! Five-field cron expressions and next-fire prediction.
//!
//! Field matching is done by the `cron` crate, the engine behind the job
//! scheduler. This module adds the classic five-field form (no seconds field,
//! weekdays 0-7 with both 0 and 7 meaning Sunday), `L` for the last day of the
//! month in the day field, and several expressions joined with `|`. All five
//! fields must match.

use crate::utils::errors::CronError;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Upper bound on how far ahead a prediction searches.
const SEARCH_YEARS: i32 = 8;

/// Day-of-month candidates for `L`
const MONTH_END_DAYS: &str = "28-31";

/// One compiled alternative of an expression
#[derive(Debug, Clone, PartialEq, Eq)]
struct Alternative {
    schedule: cron::Schedule,
    /// Only the last day of a month counts
    last_day_only: bool,
}

impl Alternative {
    fn compile(source: &str, fields: [&str; 5], last_day_only: bool) -> Result<Self, CronError> {
        let expression = format!("0 {}", fields.join(" "));
        let schedule = cron::Schedule::from_str(&expression).map_err(|e| CronError::Parse {
            expression: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            schedule,
            last_day_only,
        })
    }

    /// Wall-clock times are evaluated as UTC so there are no DST gaps.
    fn next_after(&self, after: NaiveDateTime, limit_year: i32) -> Option<NaiveDateTime> {
        self.schedule
            .after(&Utc.from_utc_datetime(&after))
            .map(|t| t.naive_utc())
            .take_while(|t| t.year() <= limit_year)
            .find(|t| !self.last_day_only || is_last_day(t.date()))
    }
}

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    alternatives: Vec<Alternative>,
}

impl CronExpression {
    pub fn parse(text: &str) -> Result<Self, CronError> {
        let mut alternatives = Vec::new();
        for pattern in text.split('|') {
            alternatives.extend(parse_pattern(pattern.trim())?);
        }

        Ok(Self {
            source: text.trim().to_string(),
            alternatives,
        })
    }

    /// The first minute strictly after `after` matching any alternative.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let limit_year = after.year() + SEARCH_YEARS;
        self.alternatives
            .iter()
            .filter_map(|a| a.next_after(after, limit_year))
            .min()
    }

    pub fn matches(&self, at: NaiveDateTime) -> bool {
        let at = truncate_to_minute(at);
        self.next_after(at - Duration::minutes(1)) == Some(at)
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parsed expression plus the predicted next fire time
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: CronExpression,
    next_fire: NaiveDateTime,
}

impl Schedule {
    /// Parse `expression` and predict its first fire time after `now`.
    ///
    /// Fails if the expression is malformed or never matches a future date.
    pub fn configure(expression: &str, now: NaiveDateTime) -> Result<Self, CronError> {
        let expression = CronExpression::parse(expression)?;
        let next_fire = expression
            .next_after(now)
            .ok_or_else(|| CronError::NeverFires(expression.to_string()))?;

        Ok(Self {
            expression,
            next_fire,
        })
    }

    /// Returns true once `now` has reached the predicted fire time, advancing
    /// the prediction one step past the previous one.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        if now < self.next_fire {
            return false;
        }

        self.next_fire = match self.expression.next_after(self.next_fire) {
            Some(next) => next,
            None => {
                warn!(
                    "Cron expression {} has no further matches, schedule disabled",
                    self.expression
                );
                NaiveDateTime::MAX
            }
        };
        true
    }

    pub fn next_fire(&self) -> NaiveDateTime {
        self.next_fire
    }

    pub fn expression(&self) -> &CronExpression {
        &self.expression
    }

    /// The next `count` fire times, starting with the pending one.
    pub fn upcoming(&self, count: usize) -> Vec<NaiveDateTime> {
        let mut times = Vec::with_capacity(count);
        let mut next = Some(self.next_fire);
        while let Some(t) = next {
            if times.len() == count || t == NaiveDateTime::MAX {
                break;
            }
            times.push(t);
            next = self.expression.next_after(t);
        }
        times
    }
}

fn parse_pattern(text: &str) -> Result<Vec<Alternative>, CronError> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields[..] else {
        return Err(CronError::FieldCount(fields.len(), text.to_string()));
    };

    let weekday = weekday_field(weekday).map_err(|reason| CronError::Parse {
        expression: text.to_string(),
        reason,
    })?;

    let mut days = Vec::new();
    let mut last_day = false;
    for part in day.split(',') {
        if part.eq_ignore_ascii_case("l") {
            last_day = true;
        } else {
            days.push(part);
        }
    }

    let mut alternatives = Vec::with_capacity(2);
    if !days.is_empty() {
        let days = days.join(",");
        alternatives.push(Alternative::compile(
            text,
            [minute, hour, &days, month, &weekday],
            false,
        )?);
    }
    if last_day {
        alternatives.push(Alternative::compile(
            text,
            [minute, hour, MONTH_END_DAYS, month, &weekday],
            true,
        )?);
    }
    Ok(alternatives)
}

/// Rewrite a 0-7 weekday field (Sunday is 0 or 7) into the 1-7 numbering of
/// the `cron` crate (Sunday is 1). `*`-based parts and names already agree.
fn weekday_field(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (part, None),
        };
        if base == "*" || base.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push(part.to_string());
            continue;
        }

        let step_by = match step {
            Some(step) => step
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid step in day-of-week {:?}", part))?,
            None => 1,
        };
        let (lo, hi) = match base.split_once('-') {
            Some((a, b)) => (weekday_number(a)?, weekday_number(b)?),
            None => {
                let v = weekday_number(base)?;
                (v, if step.is_some() { 7 } else { v })
            }
        };
        if lo > hi {
            return Err(format!("invalid day-of-week range {:?}", part));
        }
        out.extend((lo..=hi).step_by(step_by).map(|v| (v % 7 + 1).to_string()));
    }
    Ok(out.join(","))
}

fn weekday_number(text: &str) -> Result<u32, String> {
    text.parse::<u32>()
        .ok()
        .filter(|v| *v <= 7)
        .ok_or_else(|| format!("day-of-week value {:?} is not 0-7", text))
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t - Duration::seconds(t.second() as i64) - Duration::nanoseconds(t.nanosecond() as i64)
}

fn is_last_day(date: NaiveDate) -> bool {
    date.succ_opt()
        .map(|next| next.month() != date.month())
        .unwrap_or(true)
}
