use std::str::FromStr;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime};

use crate::error::MixError;

const PERIOD_FORMAT: &str = "%Y-%m-%d";

/// Sampling frequency of a period index.
///
/// Day steps are unanchored. Week steps land on Sundays and month steps
/// on the first or last day of a month; a start date off its anchor rolls
/// forward to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Days(u32),
    /// `W`: weeks ending on Sunday.
    Weeks(u32),
    /// `MS`: first day of the month.
    MonthStart(u32),
    /// `M`: last day of the month.
    MonthEnd(u32),
}

fn first_of_month(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)
}

fn last_of_month(date: NaiveDate) -> Option<NaiveDate> {
    first_of_month(date)?
        .checked_add_months(Months::new(1))?
        .pred_opt()
}

impl Frequency {
    /// First anchored date on or after `date`.
    pub fn anchor(&self, date: NaiveDate) -> Option<NaiveDate> {
        match *self {
            Frequency::Days(_) => Some(date),
            Frequency::Weeks(_) => {
                let ahead = (7 - date.weekday().num_days_from_sunday()) % 7;
                date.checked_add_signed(Duration::days(ahead as i64))
            }
            Frequency::MonthStart(_) => {
                if date.day() == 1 {
                    Some(date)
                } else {
                    first_of_month(date)?.checked_add_months(Months::new(1))
                }
            }
            Frequency::MonthEnd(_) => last_of_month(date),
        }
    }

    /// Next date after an anchored `date`.
    pub fn advance(&self, date: NaiveDate) -> Option<NaiveDate> {
        match *self {
            Frequency::Days(n) => date.checked_add_signed(Duration::days(n as i64)),
            Frequency::Weeks(n) => date.checked_add_signed(Duration::weeks(n as i64)),
            Frequency::MonthStart(n) => first_of_month(date)?.checked_add_months(Months::new(n)),
            Frequency::MonthEnd(n) => {
                last_of_month(first_of_month(date)?.checked_add_months(Months::new(n))?)
            }
        }
    }
}

impl Default for Frequency {
    fn default() -> Self {
        Frequency::Days(7)
    }
}

impl FromStr for Frequency {
    type Err = MixError;

    /// Accepts `D`, `nD`, `W`, `nW`, `MS`, `nMS`, `M` and `nM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let unit_at = upper
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| MixError::InvalidData(format!("frequency '{s}' has no unit")))?;
        let (count, unit) = upper.split_at(unit_at);
        let count: u32 = if count.is_empty() {
            1
        } else {
            count
                .parse()
                .map_err(|_| MixError::InvalidData(format!("bad frequency multiple in '{s}'")))?
        };
        if count == 0 {
            return Err(MixError::InvalidData(format!("frequency '{s}' is zero")));
        }
        match unit {
            "D" => Ok(Frequency::Days(count)),
            "W" | "W-SUN" => Ok(Frequency::Weeks(count)),
            "MS" => Ok(Frequency::MonthStart(count)),
            "M" | "ME" => Ok(Frequency::MonthEnd(count)),
            _ => Err(MixError::InvalidData(format!("unsupported frequency '{s}'"))),
        }
    }
}

/// Anchored dates from `start` stepping by `freq` while `<= end`.
pub fn date_range(start: NaiveDate, end: NaiveDate, freq: Frequency) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut current = freq.anchor(start);
    while let Some(date) = current {
        if date > end {
            break;
        }
        out.push(date);
        current = freq.advance(date);
    }
    out
}

/// `periods` anchored dates starting at `start`.
pub fn date_periods(start: NaiveDate, periods: usize, freq: Frequency) -> Vec<NaiveDate> {
    std::iter::successors(freq.anchor(start), |d| freq.advance(*d))
        .take(periods)
        .collect()
}

pub fn parse_period(raw: &str) -> Result<NaiveDate, MixError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, PERIOD_FORMAT) {
        return Ok(date);
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(stamp.date());
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y")
        .map_err(|_| MixError::InvalidData(format!("unrecognised date '{raw}'")))
}

pub fn format_period(date: NaiveDate) -> String {
    date.format(PERIOD_FORMAT).to_string()
}
