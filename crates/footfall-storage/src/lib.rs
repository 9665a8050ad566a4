//! Durable run-state log + HTTP transport for the footfall sync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use footfall_core::{NewRunState, RunState};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "footfall-storage";

/// Append-only JSON Lines log of completed runs.
///
/// One line per [`RunState`]. Lines are never rewritten; the full history is kept.
#[derive(Debug, Clone)]
pub struct RunStateLog {
    path: PathBuf,
}

impl RunStateLog {
    /// Open (creating if needed) the log at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating run-state directory {}", parent.display()))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening run-state log {}", path.display()))?;
        Ok(Self { path })
    }

    /// Handle on a log that may not exist yet. Nothing is created on disk;
    /// reads of a missing file see an empty log.
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp `entry` with a creation time and append it durably.
    ///
    /// The stamp is strictly greater than every existing entry's, so the new
    /// entry is always the most recent even if the wall clock stepped back.
    pub async fn append_run(&self, entry: NewRunState) -> anyhow::Result<RunState> {
        let mut created_at = Utc::now();
        if let Some(latest) = self.most_recent_run().await? {
            if created_at <= latest.created_at {
                created_at = latest.created_at + chrono::Duration::microseconds(1);
            }
        }
        let state = RunState::stamp(entry, created_at);

        let mut line = serde_json::to_vec(&state).context("serializing run-state entry")?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening run-state log {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to run-state log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing run-state log {}", self.path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing run-state log {}", self.path.display()))?;

        debug!(created_at = %state.created_at, "run-state appended");
        Ok(state)
    }

    /// Entry with the greatest `created_at`; ties go to the later line.
    pub async fn most_recent_run(&self) -> anyhow::Result<Option<RunState>> {
        let entries = self.load_all().await?;
        Ok(entries.into_iter().reduce(|best, candidate| {
            if candidate.created_at >= best.created_at {
                candidate
            } else {
                best
            }
        }))
    }

    /// Up to `limit` entries, newest first.
    pub async fn recent_runs(&self, limit: usize) -> anyhow::Result<Vec<RunState>> {
        let mut entries = self.load_all().await?;
        // Stable sort keeps file order for equal stamps; reverse puts later lines first.
        entries.sort_by_key(|e| e.created_at);
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    async fn load_all(&self) -> anyhow::Result<Vec<RunState>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading run-state log {}", self.path.display()))
            }
        };
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str::<RunState>(line).with_context(|| {
                    format!("parsing run-state log {} line {}", self.path.display(), idx + 1)
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDisposition {
    Success,
    /// Credential rejected; the only failure a caller may recover from.
    Unauthorized,
    Failure,
}

pub fn classify_status(status: StatusCode) -> StatusDisposition {
    if status.is_success() {
        StatusDisposition::Success
    } else if status == StatusCode::UNAUTHORIZED {
        StatusDisposition::Unauthorized
    } else {
        StatusDisposition::Failure
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unauthorized (401) for {url}")]
    Unauthorized { url: String },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Thin reqwest wrapper. No retries: every failure goes back to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` with `query` and a bearer token, decoding the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        bearer: &str,
    ) -> Result<T, FetchError> {
        let request = self.client.get(url).query(query).bearer_auth(bearer);
        let span = info_span!("http_fetch", method = "GET", url);
        self.send_json(request, url).instrument(span).await
    }

    /// POST a form-encoded body to `url`, decoding the JSON response.
    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let request = self.client.post(url).form(form);
        let span = info_span!("http_fetch", method = "POST", url);
        self.send_json(request, url).instrument(span).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<T, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        match classify_status(status) {
            StatusDisposition::Success => {
                let body = resp.bytes().await?;
                debug!(status = status.as_u16(), bytes = body.len(), "response received");
                serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                })
            }
            StatusDisposition::Unauthorized => Err(FetchError::Unauthorized { url: final_url }),
            StatusDisposition::Failure => {
                let body = resp.text().await.unwrap_or_default();
                Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body,
                })
            }
        }
    }
}
