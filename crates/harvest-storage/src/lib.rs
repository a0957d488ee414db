//! Ledger + shard persistence and HTTP fetch utilities for the harvester.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use harvest_core::HarvestRecord;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

pub const LEDGER_FILE_NAME: &str = "processed.json";
pub const DEFAULT_SHARD_CAPACITY: usize = 1000;

const SHARD_PREFIX: &str = "dataset_";
const SHARD_SUFFIX: &str = ".json";

/// Replace `path` with `bytes` using a temp file in the same directory and a rename.
pub async fn write_file_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Two-space indented JSON; non-ASCII is written as-is.
fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).context("serializing json")
}

/// Reads a file, mapping "missing" to `None`. Other I/O errors propagate.
async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Durable set of identities that already produced at least one record.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeSet<String>,
    loaded: usize,
}

impl Ledger {
    /// Loads the ledger at `path`. A missing or corrupt ledger yields an empty set;
    /// any other read failure is returned so the file is never overwritten blind.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let bytes = read_optional(&path)
            .await
            .with_context(|| format!("reading ledger {}", path.display()))?;
        let entries = match bytes {
            Some(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(items) => items.into_iter().collect(),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ledger is corrupt; starting empty");
                    BTreeSet::new()
                }
            },
            None => BTreeSet::new(),
        };
        let loaded = entries.len();
        Ok(Self {
            path,
            entries,
            loaded,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains(identity)
    }

    /// Returns `false` if the identity was already present.
    pub fn add(&mut self, identity: impl Into<String>) -> bool {
        self.entries.insert(identity.into())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn added_since_load(&self) -> usize {
        self.entries.len().saturating_sub(self.loaded)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Overwrites the ledger file with the full sorted set.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let sorted: Vec<&str> = self.iter().collect();
        let bytes = to_pretty_json(&sorted)?;
        write_file_atomically(&self.path, &bytes)
            .await
            .with_context(|| format!("persisting ledger {}", self.path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHandle {
    pub index: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedRecord {
    pub shard: ShardHandle,
    /// Record count of the shard after the append.
    pub shard_len: usize,
}

/// Numbered, capacity-bounded `dataset_<N>.json` files. Only the highest-numbered
/// shard is ever written; once it reaches capacity the next append opens N+1.
#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
    capacity: usize,
}

impl ShardStore {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            capacity: capacity.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shard_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{SHARD_PREFIX}{index}{SHARD_SUFFIX}"))
    }

    pub fn parse_shard_index(file_name: &str) -> Option<u32> {
        file_name
            .strip_prefix(SHARD_PREFIX)?
            .strip_suffix(SHARD_SUFFIX)?
            .parse()
            .ok()
    }

    /// Existing shards ordered by index. A missing directory has no shards.
    pub async fn list_shards(&self) -> anyhow::Result<Vec<ShardHandle>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.dir.display()));
            }
        };

        let mut shards = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(Self::parse_shard_index) else {
                continue;
            };
            shards.push(ShardHandle {
                index,
                path: entry.path(),
            });
        }
        shards.sort_by_key(|s| s.index);
        Ok(shards)
    }

    /// Decoded shard contents. Absent or unparsable files read as empty; any other
    /// read failure is an error.
    pub async fn read_values(&self, shard: &ShardHandle) -> anyhow::Result<Vec<JsonValue>> {
        let bytes = read_optional(&shard.path)
            .await
            .with_context(|| format!("reading shard {}", shard.path.display()))?;
        let Some(bytes) = bytes else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice::<Vec<JsonValue>>(&bytes) {
            Ok(values) => Ok(values),
            Err(err) => {
                warn!(path = %shard.path.display(), error = %err, "shard is unparsable; treating as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Records of a shard that decode as [`HarvestRecord`]; others are skipped.
    pub async fn read_records(&self, shard: &ShardHandle) -> anyhow::Result<Vec<HarvestRecord>> {
        Ok(self
            .read_values(shard)
            .await?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// The highest-numbered shard, or a fresh one past it when it is full.
    pub async fn current_shard(&self) -> anyhow::Result<ShardHandle> {
        Ok(self.open_current().await?.0)
    }

    /// Current shard together with its decoded contents, read once.
    async fn open_current(&self) -> anyhow::Result<(ShardHandle, Vec<JsonValue>)> {
        let Some(last) = self.list_shards().await?.pop() else {
            return Ok((
                ShardHandle {
                    index: 1,
                    path: self.shard_path(1),
                },
                Vec::new(),
            ));
        };
        let values = self.read_values(&last).await?;
        if values.len() >= self.capacity {
            let index = last.index + 1;
            let next = ShardHandle {
                index,
                path: self.shard_path(index),
            };
            return Ok((next, Vec::new()));
        }
        Ok((last, values))
    }

    /// Read-modify-write append of one record to the current shard.
    pub async fn append(&self, record: &HarvestRecord) -> anyhow::Result<AppendedRecord> {
        let (shard, mut values) = self.open_current().await?;
        values.push(serde_json::to_value(record).context("encoding harvest record")?);

        let bytes = to_pretty_json(&values)?;
        write_file_atomically(&shard.path, &bytes)
            .await
            .with_context(|| format!("writing shard {}", shard.path.display()))?;
        debug!(shard = shard.index, len = values.len(), "appended record");

        Ok(AppendedRecord {
            shard_len: values.len(),
            shard,
        })
    }

    /// `(index, decoded length)` for every shard.
    pub async fn shard_lengths(&self) -> anyhow::Result<Vec<(u32, usize)>> {
        let mut out = Vec::new();
        for shard in self.list_shards().await? {
            let len = self.read_values(&shard).await?.len();
            out.push((shard.index, len));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    RateLimited,
    Failed,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::NOT_FOUND {
        StatusClass::NotFound
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else {
        StatusClass::Failed
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent with every request made through the client.
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            default_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("rate limited by {url} (reset: {reset:?})")]
    RateLimited {
        url: String,
        reset: Option<String>,
        body: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Single-attempt HTTP client. Retrying is left to the next scheduled run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(query);
        self.execute(url, request).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).json(body);
        self.execute(url, request).await
    }

    async fn execute(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let reset = resp
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match classify_status(status) {
                StatusClass::Success => {
                    let body = resp.bytes().await?.to_vec();
                    Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    })
                }
                StatusClass::NotFound => Err(FetchError::NotFound { url: final_url }),
                StatusClass::RateLimited => {
                    let body = resp.text().await.unwrap_or_default();
                    Err(FetchError::RateLimited {
                        url: final_url,
                        reset,
                        body,
                    })
                }
                StatusClass::Failed => Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                }),
            }
        }
        .instrument(span)
        .await
    }
}
