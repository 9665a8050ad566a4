//! Remote traffic API contracts + the REST adapter.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use footfall_core::{format_day, AccessToken, DateRange, TrafficRecord};
use footfall_storage::{FetchError, HttpFetcher};
use serde::{de, Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "footfall-adapters";

pub const TOKEN_PATH: &str = "/token";
pub const TRAFFIC_PATH: &str = "/api/traffic";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The bearer token was rejected (HTTP 401).
    #[error("access token rejected: {0}")]
    Unauthorized(String),
    #[error(transparent)]
    Fetch(FetchError),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl AdapterError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Unauthorized { url } => Self::Unauthorized(url),
            other => Self::Fetch(other),
        }
    }
}

/// Obtains fresh bearer tokens from the remote authentication endpoint.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<AccessToken, AdapterError>;
}

/// Retrieves hourly traffic records for an inclusive date window.
#[async_trait]
pub trait TrafficSource: Send + Sync {
    async fn fetch(
        &self,
        token: &AccessToken,
        range: DateRange,
    ) -> Result<Vec<TrafficRecord>, AdapterError>;
}

#[derive(Clone)]
pub struct ApiCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// REST client for the traffic-counter API: password-grant auth + hourly data.
#[derive(Debug, Clone)]
pub struct RestTrafficApi {
    http: HttpFetcher,
    base_url: String,
    credentials: ApiCredentials,
}

impl RestTrafficApi {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, credentials: ApiCredentials) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}{TOKEN_PATH}", self.base_url)
    }

    pub fn traffic_url(&self) -> String {
        format!("{}{TRAFFIC_PATH}", self.base_url)
    }
}

#[async_trait]
impl Authenticator for RestTrafficApi {
    async fn authenticate(&self) -> Result<AccessToken, AdapterError> {
        let form = [
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("grant_type", "password"),
        ];
        let resp: TokenResponse = self.http.post_form(&self.token_url(), &form).await?;
        let token = token_from_response(resp, Utc::now())?;
        debug!(expires_at = %token.expires_at, "access token issued");
        Ok(token)
    }
}

#[async_trait]
impl TrafficSource for RestTrafficApi {
    async fn fetch(
        &self,
        token: &AccessToken,
        range: DateRange,
    ) -> Result<Vec<TrafficRecord>, AdapterError> {
        let from = format_day(range.from);
        let to = format_day(range.to);
        let query = traffic_query(&from, &to);
        let payload: TrafficPayload = self
            .http
            .get_json(&self.traffic_url(), &query, &token.value)
            .await?;
        let records = normalize_payload(payload)?;
        debug!(records = records.len(), %range, "traffic rows normalized");
        Ok(records)
    }
}

/// Query string for the hourly, all-sites, internal-included traffic request.
pub fn traffic_query<'a>(from: &'a str, to: &'a str) -> [(&'static str, &'a str); 5] {
    [
        ("SiteCode", ""),
        ("IncludeInternalLocations", "true"),
        ("DataSummedByDay", "false"),
        ("DateFrom", from),
        ("DateTo", to),
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(rename = ".expires", default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Resolve the absolute expiry of a token response.
///
/// Prefers `.expires` (RFC 2822), then `expires_at` (RFC 3339), then
/// `expires_in` seconds counted from `received_at`.
pub fn token_from_response(
    resp: TokenResponse,
    received_at: DateTime<Utc>,
) -> Result<AccessToken, AdapterError> {
    if resp.access_token.trim().is_empty() {
        return Err(AdapterError::Malformed("empty access_token".into()));
    }

    let expires_at = if let Some(raw) = resp.expires.as_deref().or(resp.expires_at.as_deref()) {
        parse_absolute_expiry(raw)?
    } else if let Some(secs) = resp.expires_in {
        received_at + Duration::seconds(secs)
    } else {
        return Err(AdapterError::Malformed("token response has no expiry".into()));
    };

    Ok(AccessToken::new(resp.access_token, expires_at))
}

fn parse_absolute_expiry(raw: &str) -> Result<DateTime<Utc>, AdapterError> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AdapterError::Malformed(format!("unparsable token expiry {raw:?}: {err}")))
}

/// Response body: either a bare array or an object wrapping it in `data`/`Data`.
///
/// Rows are decoded one at a time so a bad row reports its index and field.
#[derive(Debug, Clone)]
pub enum TrafficPayload {
    Rows(Vec<ApiTrafficRow>),
    Wrapped { data: Vec<ApiTrafficRow> },
}

impl<'de> Deserialize<'de> for TrafficPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match JsonValue::deserialize(deserializer)? {
            JsonValue::Array(items) => decode_rows(items).map(Self::Rows),
            JsonValue::Object(mut map) => {
                let inner = map
                    .remove("data")
                    .or_else(|| map.remove("Data"))
                    .ok_or_else(|| <D::Error as de::Error>::missing_field("data"))?;
                match inner {
                    JsonValue::Array(items) => decode_rows(items).map(|data| Self::Wrapped { data }),
                    other => Err(de::Error::custom(format!(
                        "`data` must be an array of rows, got {}",
                        json_kind(&other)
                    ))),
                }
            }
            other => Err(de::Error::custom(format!(
                "expected an array of rows or an object with `data`, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn decode_rows<E: de::Error>(items: Vec<JsonValue>) -> Result<Vec<ApiTrafficRow>, E> {
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            serde_json::from_value(item).map_err(|err| E::custom(format!("row {idx}: {err}")))
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

impl TrafficPayload {
    pub fn into_rows(self) -> Vec<ApiTrafficRow> {
        match self {
            Self::Rows(rows) | Self::Wrapped { data: rows } => rows,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTrafficRow {
    #[serde(alias = "SiteCode")]
    pub site_code: String,
    #[serde(alias = "Location")]
    pub location: String,
    #[serde(alias = "IsInternal", deserialize_with = "deserialize_boolish")]
    pub is_internal: i16,
    #[serde(alias = "PeriodEnding", deserialize_with = "deserialize_period_ending")]
    pub period_ending: NaiveDateTime,
    #[serde(alias = "Ins")]
    pub ins: i64,
    #[serde(alias = "Outs")]
    pub outs: i64,
}

pub fn normalize_payload(payload: TrafficPayload) -> Result<Vec<TrafficRecord>, AdapterError> {
    payload.into_rows().into_iter().map(normalize_row).collect()
}

fn normalize_row(row: ApiTrafficRow) -> Result<TrafficRecord, AdapterError> {
    if row.ins < 0 || row.outs < 0 {
        return Err(AdapterError::Malformed(format!(
            "negative count for {}/{} at {}",
            row.site_code, row.location, row.period_ending
        )));
    }
    Ok(TrafficRecord {
        site_code: row.site_code,
        location: row.location,
        is_internal: row.is_internal,
        period_ending: row.period_ending,
        ins: row.ins,
        outs: row.outs,
    })
}

/// Parse a raw response body the same way [`RestTrafficApi`] does.
pub fn parse_traffic_json(body: &str) -> Result<Vec<TrafficRecord>, AdapterError> {
    let payload: TrafficPayload = serde_json::from_str(body)
        .map_err(|err| AdapterError::Malformed(format!("traffic body: {err}")))?;
    normalize_payload(payload)
}

pub fn load_traffic_fixture(path: impl AsRef<Path>) -> Result<Vec<TrafficRecord>> {
    let path = path.as_ref();
    let body = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_traffic_json(&body).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_token_fixture(path: impl AsRef<Path>, received_at: DateTime<Utc>) -> Result<AccessToken> {
    let path = path.as_ref();
    let body = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let resp: TokenResponse =
        serde_json::from_str(&body).with_context(|| format!("parsing {}", path.display()))?;
    token_from_response(resp, received_at).with_context(|| format!("resolving {}", path.display()))
}

fn deserialize_boolish<'de, D>(deserializer: D) -> Result<i16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    boolish_to_flag(&value).ok_or_else(|| de::Error::custom(format!("not a boolean-ish value: {value}")))
}

/// Map `true/false`, `0/1` and their string spellings to 0/1.
pub fn boolish_to_flag(value: &JsonValue) -> Option<i16> {
    match value {
        JsonValue::Bool(b) => Some(i16::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Some(0),
            Some(1) => Some(1),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Some(1),
            "false" | "0" | "no" | "n" => Some(0),
            _ => None,
        },
        _ => None,
    }
}

fn deserialize_period_ending<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_period_ending(&raw).ok_or_else(|| de::Error::custom(format!("unparsable periodEnding {raw:?}")))
}

/// Wall-clock end of the hour bucket, truncated to whole seconds.
///
/// An explicit offset is dropped; the local wall time the API reported is kept.
pub fn parse_period_ending(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let parsed = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_local()))?;
    parsed.with_nanosecond(0)
}
