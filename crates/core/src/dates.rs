//! Date arithmetic for gestation and child age.

use crate::constants::{
    DAYS_PER_MONTH, FULL_TERM_DAYS, SECOND_TRIMESTER_FROM_WEEK, THIRD_TRIMESTER_FROM_WEEK,
};
use crate::{KiaError, KiaResult};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Completed weeks since the last menstrual period: `floor((today - lmp) / 7)`.
///
/// Negative when `today` precedes `lmp`.
pub fn gestational_age_weeks(lmp_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - lmp_date).num_days().div_euclid(7)
}

/// Estimated delivery date by Naegele's rule.
pub fn estimated_due_date(lmp_date: NaiveDate) -> NaiveDate {
    lmp_date + Duration::days(FULL_TERM_DAYS)
}

/// Age in whole months: `floor((on - birth_date) / 30.44 days)`.
pub fn age_in_months(birth_date: NaiveDate, on: NaiveDate) -> i64 {
    let days = (on - birth_date).num_days();
    (days as f64 / DAYS_PER_MONTH).floor() as i64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Trimester {
    First,
    Second,
    Third,
}

impl Trimester {
    pub fn from_weeks(weeks: i64) -> Self {
        if weeks < SECOND_TRIMESTER_FROM_WEEK {
            Trimester::First
        } else if weeks < THIRD_TRIMESTER_FROM_WEEK {
            Trimester::Second
        } else {
            Trimester::Third
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Trimester::First => 1,
            Trimester::Second => 2,
            Trimester::Third => 3,
        }
    }
}

impl fmt::Display for Trimester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Inclusive date range used for aggregate statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    start: NaiveDate,
    end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> KiaResult<Self> {
        if start > end {
            return Err(KiaError::validation(format!(
                "period start {} is after period end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The calendar month containing `date`.
    pub fn month_of(date: NaiveDate) -> Self {
        let start = date.with_day(1).unwrap_or(date);
        let next_month = if start.month() == 12 {
            NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
        };
        let end = next_month
            .and_then(|d| d.pred_opt())
            .unwrap_or(date);
        Self { start, end }
    }

    /// The calendar year containing `date`.
    pub fn year_of(date: NaiveDate) -> Self {
        let start = NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date);
        let end = NaiveDate::from_ymd_opt(date.year(), 12, 31).unwrap_or(date);
        Self { start, end }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}
