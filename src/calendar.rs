use chrono::{Datelike, NaiveDate};
use std::fmt;

/// A calendar month, the unit the price models are indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    /// 1-based month number.
    pub fn month(self) -> u32 {
        self.month
    }

    /// Calendar month `n` months later; rolls over year boundaries.
    pub fn plus_months(self, n: u32) -> Self {
        let idx = i64::from(self.year) * 12 + i64::from(self.month - 1) + i64::from(n);
        Self {
            year: idx.div_euclid(12) as i32,
            month: idx.rem_euclid(12) as u32 + 1,
        }
    }

    /// The `count` months strictly after this one, ascending.
    pub fn following(self, count: u32) -> impl Iterator<Item = YearMonth> {
        (1..=count).map(move |n| self.plus_months(n))
    }

    /// `MM-YYYY` label used as the future-price key.
    pub fn label(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:04}", self.month, self.year)
    }
}

/// Source of the reference date for a prediction.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock date.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// Always reports the same date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}
