//! Harvest run orchestration: budget-governed paging, generation and bookkeeping.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{build_prompts, CandidateDescriptor, HarvestRecord};
use harvest_sources::{
    workflow_search_query, CompletionService, ContentSource, GeminiClient, GenerationAdapter,
    GenerationOutcome, GitHubClient, SearchIndex, SourceError, DEFAULT_GEMINI_MODEL,
    GEMINI_API_URL, GITHUB_API_URL, GITHUB_MAX_PER_PAGE,
};
use harvest_storage::{
    HttpClientConfig, Ledger, ShardStore, DEFAULT_SHARD_CAPACITY, LEDGER_FILE_NAME,
};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-sync";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub max_calls_per_run: usize,
    pub prompts_per_document: usize,
    pub shard_capacity: usize,
    pub page_size: u32,
    pub search_scope_filter: Option<String>,
    pub dataset_dir: PathBuf,
    pub github_token: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub github_api_url: String,
    pub gemini_api_url: String,
    pub page_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub git_commit_enabled: bool,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_calls_per_run: 5,
            prompts_per_document: 5,
            shard_capacity: DEFAULT_SHARD_CAPACITY,
            page_size: GITHUB_MAX_PER_PAGE,
            search_scope_filter: None,
            dataset_dir: PathBuf::from("datasets"),
            github_token: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            github_api_url: GITHUB_API_URL.to_string(),
            gemini_api_url: GEMINI_API_URL.to_string(),
            page_delay: Duration::from_millis(1000),
            http_timeout_secs: 30,
            user_agent: "harvest-bot/0.1".to_string(),
            git_commit_enabled: false,
            scheduler_enabled: false,
            schedule_cron: "0 0 */6 * * *".to_string(),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`; blank or malformed values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parsed = |key: &str| text(key).and_then(|v| v.parse::<u64>().ok());
        let flag = |key: &str| {
            text(key).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        };

        Self {
            max_calls_per_run: parse_or(&text, "MAX_GEMINI_CALLS_PER_RUN", defaults.max_calls_per_run),
            prompts_per_document: parse_or(&text, "QUESTIONS_PER_WORKFLOW", defaults.prompts_per_document),
            shard_capacity: parse_or(&text, "MAX_ENTRIES_PER_FILE", defaults.shard_capacity).max(1),
            page_size: parse_or(&text, "GITHUB_SEARCH_PER_PAGE", defaults.page_size)
                .clamp(1, GITHUB_MAX_PER_PAGE),
            search_scope_filter: text("SEARCH_STARS_FILTER"),
            dataset_dir: text("DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_dir),
            github_token: text("GITHUB_TOKEN").or_else(|| text("GH_TOKEN")),
            gemini_api_key: text("GEMINI_API_KEY"),
            gemini_model: text("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            github_api_url: text("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            gemini_api_url: text("GEMINI_API_URL").unwrap_or(defaults.gemini_api_url),
            page_delay: parsed("HARVEST_PAGE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_delay),
            http_timeout_secs: parsed("HARVEST_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            user_agent: text("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            git_commit_enabled: flag("HARVEST_GIT_COMMIT").unwrap_or(defaults.git_commit_enabled),
            scheduler_enabled: flag("HARVEST_SCHEDULER_ENABLED").unwrap_or(defaults.scheduler_enabled),
            schedule_cron: text("HARVEST_SCHEDULE_CRON").unwrap_or(defaults.schedule_cron),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dataset_dir.join(LEDGER_FILE_NAME)
    }

    pub fn search_query(&self) -> String {
        workflow_search_query(self.search_scope_filter.as_deref())
    }
}

fn parse_or<T: FromStr>(text: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    text(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Per-run ceiling on generation calls that produced a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget {
    used: usize,
    ceiling: usize,
}

impl RunBudget {
    pub fn new(ceiling: usize) -> Self {
        Self { used: 0, ceiling }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn remaining(&self) -> usize {
        self.ceiling - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.ceiling
    }

    /// Counts one persisted record. Refuses (returns `false`) once the ceiling is reached.
    pub fn record_success(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    ResultsExhausted,
    RateLimited,
    SearchFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_visited: usize,
    pub candidates_seen: usize,
    pub skipped_known: usize,
    pub skipped_unavailable: usize,
    pub fetch_errors: usize,
    pub generation_failures: usize,
    pub write_failures: usize,
    pub records_written: usize,
    pub identities_ledgered: usize,
    pub calls_used: usize,
    pub calls_ceiling: usize,
    pub stop_reason: StopReason,
    /// `false` when `processed.json` could not be written; this run's identities
    /// will be harvested again.
    pub ledger_persisted: bool,
    /// `None` when no publish hook is configured or the ledger was not persisted.
    pub published: Option<bool>,
}

#[derive(Debug, Default)]
struct RunCounters {
    pages_visited: usize,
    candidates_seen: usize,
    skipped_known: usize,
    skipped_unavailable: usize,
    fetch_errors: usize,
    generation_failures: usize,
    write_failures: usize,
    records_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    AlreadyHarvested,
    Unavailable,
    FetchFailed,
    NoRecords,
    Harvested(usize),
}

/// Runs after the ledger is persisted. Failure never changes the run result.
#[async_trait]
pub trait PublishHook: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    async fn publish(&self, dataset_dir: &Path) -> Result<()>;
}

#[derive(Default)]
pub struct NoopPublishHook;

#[async_trait]
impl PublishHook for NoopPublishHook {
    fn enabled(&self) -> bool {
        false
    }

    async fn publish(&self, _dataset_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Commits and pushes the dataset directory from the enclosing git checkout.
pub struct GitPublishHook {
    repo_root: PathBuf,
    message: String,
}

impl GitPublishHook {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            message: "Update datasets via harvest".to_string(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<bool> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .with_context(|| format!("spawning git {}", args.join(" ")))?;
        if !output.status.success() {
            debug!(
                args = %args.join(" "),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git command failed"
            );
        }
        Ok(output.status.success())
    }
}

#[async_trait]
impl PublishHook for GitPublishHook {
    async fn publish(&self, dataset_dir: &Path) -> Result<()> {
        let dir = dataset_dir.to_string_lossy();
        if !self.git(&["add", "--", dir.as_ref()]).await? {
            bail!("git add {dir} failed");
        }
        let committed = self
            .git(&[
                "-c",
                "user.name=harvest-bot",
                "-c",
                "user.email=harvest-bot@users.noreply.github.com",
                "commit",
                "-m",
                &self.message,
            ])
            .await?;
        if !committed {
            info!("nothing to commit");
            return Ok(());
        }
        if !self.git(&["push"]).await? {
            bail!("git push failed");
        }
        Ok(())
    }
}

pub struct SyncPipeline {
    config: HarvestConfig,
    search: Box<dyn SearchIndex>,
    content: Box<dyn ContentSource>,
    generator: GenerationAdapter,
    shards: ShardStore,
    publisher: Box<dyn PublishHook>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    /// Wires the GitHub and Gemini clients described by `config`.
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let Some(api_key) = config.gemini_api_key.clone() else {
            bail!("GEMINI_API_KEY environment variable is not set");
        };
        let http = HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        };

        let github = GitHubClient::new(
            config.github_api_url.clone(),
            config.github_token.as_deref(),
            http.clone(),
        )?;
        let search = github.code_search(config.search_query(), config.page_size);
        let gemini = GeminiClient::new(
            &config.gemini_api_url,
            &api_key,
            &config.gemini_model,
            http,
        )?;

        let publisher: Box<dyn PublishHook> = if config.git_commit_enabled {
            Box::new(GitPublishHook::new("."))
        } else {
            Box::<NoopPublishHook>::default()
        };

        Ok(Self::with_services(
            config,
            Box::new(search),
            Box::new(github.contents()),
            Box::new(gemini),
        )
        .with_publisher(publisher))
    }

    pub fn with_services(
        config: HarvestConfig,
        search: Box<dyn SearchIndex>,
        content: Box<dyn ContentSource>,
        completion: Box<dyn CompletionService>,
    ) -> Self {
        let shards = ShardStore::new(config.dataset_dir.clone(), config.shard_capacity);
        Self {
            config,
            search,
            content,
            generator: GenerationAdapter::new(completion),
            shards,
            publisher: Box::<NoopPublishHook>::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_publisher(mut self, publisher: Box<dyn PublishHook>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Executes one run, waiting for any run already in progress to finish first.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        self.execute(run_id)
            .instrument(info_span!("harvest_run", %run_id))
            .await
    }

    /// Like [`run_once`](Self::run_once) but returns `None` if a run is already active.
    pub async fn try_run_once(&self) -> Option<Result<RunSummary>> {
        let _guard = self.run_lock.try_lock().ok()?;
        let run_id = Uuid::new_v4();
        Some(
            self.execute(run_id)
                .instrument(info_span!("harvest_run", %run_id))
                .await,
        )
    }

    async fn execute(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut ledger = Ledger::load(self.config.ledger_path())
            .await
            .context("loading ledger at start of run")?;
        let mut budget = RunBudget::new(self.config.max_calls_per_run);
        let mut counters = RunCounters::default();
        info!(
            ledger_entries = ledger.len(),
            ceiling = budget.ceiling(),
            "starting harvest run"
        );

        let mut page = 1u32;
        let stop_reason = loop {
            if budget.is_exhausted() {
                break StopReason::BudgetExhausted;
            }

            let candidates = match self.search.next_page(page).await {
                Ok(candidates) => candidates,
                Err(SourceError::RateLimited(reason)) => {
                    error!(page, reason = %reason, "search rate limited; ending run");
                    break StopReason::RateLimited;
                }
                Err(err) => {
                    error!(page, error = %err, "search failed; ending run");
                    break StopReason::SearchFailed;
                }
            };
            if candidates.is_empty() {
                info!(page, "no more search items");
                break StopReason::ResultsExhausted;
            }
            counters.pages_visited += 1;

            for candidate in &candidates {
                if budget.is_exhausted() {
                    break;
                }
                let outcome = self
                    .harvest_candidate(candidate, &mut ledger, &mut budget, &mut counters)
                    .await;
                debug!(identity = %candidate.identity(), ?outcome, "candidate finished");
            }

            if budget.is_exhausted() {
                info!(used = budget.used(), "generation limit reached");
                break StopReason::BudgetExhausted;
            }
            page += 1;
            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        };

        let ledger_persisted = match ledger.persist().await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    path = %ledger.path().display(),
                    error = %format!("{err:#}"),
                    "persisting ledger failed"
                );
                false
            }
        };

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_visited: counters.pages_visited,
            candidates_seen: counters.candidates_seen,
            skipped_known: counters.skipped_known,
            skipped_unavailable: counters.skipped_unavailable,
            fetch_errors: counters.fetch_errors,
            generation_failures: counters.generation_failures,
            write_failures: counters.write_failures,
            records_written: counters.records_written,
            identities_ledgered: ledger.added_since_load(),
            calls_used: budget.used(),
            calls_ceiling: budget.ceiling(),
            stop_reason,
            ledger_persisted,
            published: None,
        };
        info!(
            calls_used = summary.calls_used,
            records_written = summary.records_written,
            identities_ledgered = summary.identities_ledgered,
            stop_reason = ?summary.stop_reason,
            ledger_persisted,
            "harvest run finished"
        );

        if ledger_persisted && self.publisher.enabled() {
            match self.publisher.publish(self.shards.dir()).await {
                Ok(()) => summary.published = Some(true),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "publishing datasets failed");
                    summary.published = Some(false);
                }
            }
        }

        Ok(summary)
    }

    async fn harvest_candidate(
        &self,
        candidate: &CandidateDescriptor,
        ledger: &mut Ledger,
        budget: &mut RunBudget,
        counters: &mut RunCounters,
    ) -> CandidateOutcome {
        counters.candidates_seen += 1;
        let identity = candidate.identity();
        if ledger.contains(&identity) {
            counters.skipped_known += 1;
            return CandidateOutcome::AlreadyHarvested;
        }

        let document = match self.content.fetch(candidate).await {
            Ok(Some(text)) if !text.is_empty() => text,
            Ok(_) => {
                counters.skipped_unavailable += 1;
                info!(identity = %identity, "skip: empty content");
                return CandidateOutcome::Unavailable;
            }
            Err(err) => {
                counters.fetch_errors += 1;
                error!(identity = %identity, error = %err, "fetching content failed");
                return CandidateOutcome::FetchFailed;
            }
        };

        let mut written = 0usize;
        for prompt in build_prompts(&document, self.config.prompts_per_document) {
            let style = prompt.style.style_id();
            if budget.is_exhausted() {
                info!(identity = %identity, style, "limit: no further generation calls this run");
                break;
            }

            let question = match self.generator.generate(&prompt).await {
                GenerationOutcome::Success(question) => question,
                outcome => {
                    counters.generation_failures += 1;
                    info!(identity = %identity, style, ?outcome, "skip: no usable completion");
                    continue;
                }
            };

            let record = HarvestRecord::new(
                candidate,
                question,
                document.clone(),
                prompt.style,
                Utc::now(),
            );
            match self.shards.append(&record).await {
                Ok(appended) => {
                    budget.record_success();
                    written += 1;
                    counters.records_written += 1;
                    info!(
                        identity = %identity,
                        style,
                        shard = appended.shard.index,
                        used = budget.used(),
                        ceiling = budget.ceiling(),
                        "added"
                    );
                }
                Err(err) => {
                    counters.write_failures += 1;
                    error!(identity = %identity, style, error = %format!("{err:#}"), "appending record failed");
                }
            }
        }

        if written == 0 {
            return CandidateOutcome::NoRecords;
        }
        ledger.add(identity);
        CandidateOutcome::Harvested(written)
    }

    /// Registers the configured cron job when scheduling is enabled. Overlapping
    /// ticks are skipped rather than queued.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.schedule_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.try_run_once().await {
                    None => warn!("previous harvest run still active; skipping tick"),
                    Some(Ok(summary)) if !summary.ledger_persisted => warn!(
                        run_id = %summary.run_id,
                        records_written = summary.records_written,
                        "scheduled harvest run finished without writing the ledger"
                    ),
                    Some(Ok(summary)) => info!(
                        run_id = %summary.run_id,
                        records_written = summary.records_written,
                        "scheduled harvest run complete"
                    ),
                    Some(Err(err)) => {
                        error!(error = %format!("{err:#}"), "scheduled harvest run failed")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let pipeline = SyncPipeline::new(HarvestConfig::from_env())?;
    pipeline.run_once().await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardStatus {
    pub index: u32,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub dataset_dir: String,
    pub capacity: usize,
    pub ledger_entries: usize,
    pub shards: Vec<ShardStatus>,
    pub total_records: usize,
}

impl DatasetStatus {
    /// Every shard but the last is exactly full; none is over capacity.
    pub fn capacity_invariant_holds(&self) -> bool {
        let Some((last, rest)) = self.shards.split_last() else {
            return true;
        };
        last.records <= self.capacity && rest.iter().all(|s| s.records == self.capacity)
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Harvest Dataset Status".to_string(),
            String::new(),
            format!("- dataset dir: `{}`", self.dataset_dir),
            format!("- ledger entries: {}", self.ledger_entries),
            format!("- total records: {}", self.total_records),
            format!("- shard capacity: {}", self.capacity),
            format!(
                "- capacity invariant: {}",
                if self.capacity_invariant_holds() { "ok" } else { "VIOLATED" }
            ),
            String::new(),
            "## Shards".to_string(),
        ];
        if self.shards.is_empty() {
            lines.push("- (none)".to_string());
        }
        for shard in &self.shards {
            lines.push(format!("- dataset_{}.json: {}", shard.index, shard.records));
        }
        lines.join("\n")
    }
}

/// Summarizes a dataset directory without modifying it.
pub async fn status_report(dataset_dir: impl Into<PathBuf>, capacity: usize) -> Result<DatasetStatus> {
    let dataset_dir = dataset_dir.into();
    let ledger = Ledger::load(dataset_dir.join(LEDGER_FILE_NAME)).await?;
    let store = ShardStore::new(dataset_dir.clone(), capacity);
    let shards: Vec<ShardStatus> = store
        .shard_lengths()
        .await?
        .into_iter()
        .map(|(index, records)| ShardStatus { index, records })
        .collect();
    Ok(DatasetStatus {
        dataset_dir: dataset_dir.display().to_string(),
        capacity: store.capacity(),
        ledger_entries: ledger.len(),
        total_records: shards.iter().map(|s| s.records).sum(),
        shards,
    })
}
