use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, UtcOffset, Weekday};

use crate::codec::CodecError;
use crate::model::Timestamp;

/// ISO-8601 calendar week, always evaluated in UTC.
///
/// Stored as the Monday that starts the week so every value is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IsoWeek {
    monday: Date,
}

impl IsoWeek {
    pub fn containing(at: Timestamp) -> Self {
        let date = at.to_offset(UtcOffset::UTC).date();
        let back = i64::from(date.weekday().number_days_from_monday());
        let monday = date.saturating_sub(Duration::days(back));
        Self { monday }
    }

    pub fn year(&self) -> i32 {
        self.monday.to_iso_week_date().0
    }

    pub fn week(&self) -> u8 {
        self.monday.to_iso_week_date().1
    }

    pub fn start(&self) -> Timestamp {
        self.monday.midnight().assume_utc()
    }

    pub fn end(&self) -> Timestamp {
        self.start().saturating_add(Duration::weeks(1))
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        at >= self.start() && at < self.end()
    }

    pub fn previous(&self) -> Self {
        Self {
            monday: self.monday.saturating_sub(Duration::weeks(1)),
        }
    }
}

impl fmt::Display for IsoWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year(), self.week())
    }
}

impl FromStr for IsoWeek {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::InvalidWeek(value.to_string());
        let (year, week) = value.split_once("-W").ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let week: u8 = week.parse().map_err(|_| invalid())?;
        let monday = Date::from_iso_week_date(year, week, Weekday::Monday).map_err(|_| invalid())?;
        Ok(Self { monday })
    }
}

impl TryFrom<String> for IsoWeek {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IsoWeek> for String {
    fn from(value: IsoWeek) -> Self {
        value.to_string()
    }
}
