//! Core domain model for the footfall traffic sync.

use std::fmt;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "footfall-core";

/// Calendar-day format used on the wire and in the run-state log.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Tokens are treated as expired this long before their real expiry.
pub const TOKEN_SAFETY_MARGIN_MINUTES: i64 = 5;

/// One sensor reading for one location for one hour.
///
/// The triple (`site_code`, `location`, `period_ending`) identifies a record;
/// `ins`/`outs` are the only columns a later fetch may overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub site_code: String,
    pub location: String,
    /// 0 = external measurement point, 1 = internal.
    pub is_internal: i16,
    pub period_ending: NaiveDateTime,
    pub ins: i64,
    pub outs: i64,
}

impl TrafficRecord {
    pub fn key(&self) -> RecordKey<'_> {
        RecordKey {
            site_code: &self.site_code,
            location: &self.location,
            period_ending: self.period_ending,
        }
    }
}

/// Borrowed composite key of a [`TrafficRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey<'a> {
    pub site_code: &'a str,
    pub location: &'a str,
    pub period_ending: NaiveDateTime,
}

/// Bearer credential with its absolute expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// True while `now` is still before the expiry minus the safety margin.
    pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::minutes(TOKEN_SAFETY_MARGIN_MINUTES) > now
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Inclusive calendar-date window requested from the remote API.
///
/// No ordering check is applied; the upstream API owns boundary semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", format_day(self.from), format_day(self.to))
    }
}

/// Run-state entry before the store has stamped it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRunState {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub record_count: u64,
}

/// Persisted metadata about one completed run. Immutable once appended.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub record_count: u64,
    pub created_at: DateTime<Utc>,
}

impl RunState {
    pub fn stamp(new: NewRunState, created_at: DateTime<Utc>) -> Self {
        Self {
            access_token: new.access_token,
            access_token_expires_at: new.access_token_expires_at,
            from_date: new.from_date,
            to_date: new.to_date,
            record_count: new.record_count,
            created_at,
        }
    }

    pub fn token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone(), self.access_token_expires_at)
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.from_date, self.to_date)
    }
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("access_token", &"<redacted>")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("from_date", &self.from_date)
            .field("to_date", &self.to_date)
            .field("record_count", &self.record_count)
            .field("created_at", &self.created_at)
            .finish()
    }
}

pub fn day_before(date: NaiveDate) -> NaiveDate {
    date.pred_opt().unwrap_or(NaiveDate::MIN)
}

/// Yesterday in the system's local time zone.
pub fn yesterday_local() -> NaiveDate {
    day_before(Local::now().date_naive())
}

pub fn format_day(date: NaiveDate) -> String {
    date.format(DAY_FORMAT).to_string()
}

pub fn parse_day(input: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(input.trim(), DAY_FORMAT)
}
