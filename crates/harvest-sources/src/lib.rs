//! Collaborator contracts (search, content, completion) and their GitHub/Gemini implementations.

use anyhow::Context;
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use harvest_core::{normalize_question, CandidateDescriptor, PromptRequest};
use harvest_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "harvest-sources";

pub const GITHUB_API_URL: &str = "https://api.github.com";
pub const GITHUB_MAX_PER_PAGE: u32 = 100;
pub const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

const SAFETY_FINISH_REASONS: &[&str] = &["SAFETY", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { .. } => SourceError::RateLimited(err.to_string()),
            FetchError::Decode { .. } => SourceError::Malformed(err.to_string()),
            _ => SourceError::Transport(err.to_string()),
        }
    }
}

/// Paginated search index. An empty page ends the listing.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn next_page(&self, page: u32) -> Result<Vec<CandidateDescriptor>, SourceError>;
}

/// Fetches raw document text. `Ok(None)` means the document is unavailable.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, candidate: &CandidateDescriptor) -> Result<Option<String>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Text(String),
    /// Refused by the service's safety policy; carries the reported reason.
    Blocked(String),
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completion, SourceError>;
}

pub fn workflow_search_query(scope_filter: Option<&str>) -> String {
    let mut parts = vec!["path:.github/workflows", "extension:yml", "extension:yaml"];
    if let Some(filter) = scope_filter.map(str::trim).filter(|f| !f.is_empty()) {
        parts.push(filter);
    }
    parts.join(" ")
}

/// Shared GitHub REST client; hands out the search pager and the contents fetcher.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: HttpFetcher,
    api_url: String,
}

impl GitHubClient {
    pub fn new(
        api_url: impl Into<String>,
        token: Option<&str>,
        mut http: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        http.default_headers
            .push(("Accept".into(), "application/vnd.github.v3+json".into()));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            http.default_headers
                .push(("Authorization".into(), format!("token {token}")));
        }
        let http = HttpFetcher::new(http).context("building GitHub http client")?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn code_search(&self, query: impl Into<String>, per_page: u32) -> GitHubCodeSearch {
        GitHubCodeSearch {
            client: self.clone(),
            query: query.into(),
            per_page: per_page.clamp(1, GITHUB_MAX_PER_PAGE),
        }
    }

    pub fn contents(&self) -> GitHubContents {
        GitHubContents {
            client: self.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CodeSearchResponse {
    #[serde(default)]
    items: Vec<CodeSearchItem>,
}

#[derive(Debug, Deserialize)]
struct CodeSearchItem {
    path: Option<String>,
    url: Option<String>,
    html_url: Option<String>,
    repository: Option<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    full_name: Option<String>,
}

fn item_to_candidate(item: CodeSearchItem) -> Option<CandidateDescriptor> {
    let path = item.path.filter(|p| !p.is_empty())?;
    let content_ref = item.url.filter(|u| !u.is_empty())?;
    let source_repo = item
        .repository
        .and_then(|r| r.full_name)
        .unwrap_or_else(|| "unknown".to_string());
    let display_url = item.html_url.unwrap_or_else(|| content_ref.clone());
    Some(CandidateDescriptor {
        source_repo,
        path,
        content_ref,
        display_url,
    })
}

/// Pages through GitHub code search for workflow files.
#[derive(Debug, Clone)]
pub struct GitHubCodeSearch {
    client: GitHubClient,
    query: String,
    per_page: u32,
}

#[async_trait]
impl SearchIndex for GitHubCodeSearch {
    async fn next_page(&self, page: u32) -> Result<Vec<CandidateDescriptor>, SourceError> {
        let url = format!("{}/search/code", self.client.api_url);
        let query = [
            ("q", self.query.clone()),
            ("per_page", self.per_page.to_string()),
            ("page", page.to_string()),
        ];
        let resp = match self.client.http.get(&url, &query).await {
            Ok(resp) => resp,
            Err(FetchError::RateLimited { url, reset, body }) => {
                warn!(
                    page,
                    reset = reset.as_deref().unwrap_or("unknown"),
                    body = %body,
                    "code search rate limited"
                );
                return Err(SourceError::RateLimited(format!(
                    "{url} (reset: {})",
                    reset.as_deref().unwrap_or("unknown")
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let parsed: CodeSearchResponse = resp.json()?;
        Ok(parsed
            .items
            .into_iter()
            .filter_map(item_to_candidate)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: Option<String>,
    encoding: Option<String>,
}

/// Fetches file bodies through the GitHub contents API.
#[derive(Debug, Clone)]
pub struct GitHubContents {
    client: GitHubClient,
}

#[async_trait]
impl ContentSource for GitHubContents {
    async fn fetch(&self, candidate: &CandidateDescriptor) -> Result<Option<String>, SourceError> {
        let resp = match self.client.http.get(&candidate.content_ref, &[]).await {
            Ok(resp) => resp,
            Err(FetchError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let body: ContentsResponse = resp.json()?;
        let Some(content) = body.content.filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        decode_contents(&content, body.encoding.as_deref()).map(Some)
    }
}

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decodes a contents-API payload into text.
///
/// Base64 payloads arrive wrapped at 60 columns; whitespace is stripped before
/// decoding and missing or excess padding is tolerated. Invalid UTF-8 is
/// replaced rather than rejected.
pub fn decode_contents(content: &str, encoding: Option<&str>) -> Result<String, SourceError> {
    match encoding {
        None | Some("base64") => {}
        Some(_) => return Ok(content.to_string()),
    }
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(&compact)
        .or_else(|_| LENIENT_BASE64.decode(compact.trim_end_matches('=')))
        .map_err(|err| SourceError::Malformed(format!("undecodable base64 content: {err}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SafetyRating {
    category: Option<String>,
    #[serde(default)]
    blocked: bool,
}

fn interpret_generate_response(resp: GenerateContentResponse) -> Result<Completion, SourceError> {
    if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
        return Ok(Completion::Blocked(format!("prompt blocked: {reason}")));
    }
    let Some(candidate) = resp.candidates.into_iter().next() else {
        return Err(SourceError::Malformed("no candidates in response".into()));
    };
    if let Some(rating) = candidate.safety_ratings.iter().find(|r| r.blocked) {
        return Ok(Completion::Blocked(format!(
            "blocked by safety rating {}",
            rating.category.as_deref().unwrap_or("unknown")
        )));
    }
    if let Some(reason) = candidate
        .finish_reason
        .as_deref()
        .filter(|r| SAFETY_FINISH_REASONS.contains(r))
    {
        return Ok(Completion::Blocked(format!("finish reason {reason}")));
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(SourceError::Malformed("candidate has no text".into()));
    }
    Ok(Completion::Text(text))
}

/// `generateContent` client for a single Gemini model.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: HttpFetcher,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(
        api_url: &str,
        api_key: &str,
        model: &str,
        mut http: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        http.default_headers
            .push(("x-goog-api-key".into(), api_key.to_string()));
        let http = HttpFetcher::new(http).context("building Gemini http client")?;
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            api_url.trim_end_matches('/'),
            model
        );
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl CompletionService for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<Completion, SourceError> {
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        let resp = self.http.post_json(&self.endpoint, &body).await?;
        interpret_generate_response(resp.json()?)
    }
}

/// Result of one generation attempt. Only `Success` yields a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success(String),
    Blocked(String),
    TransportFailure(String),
    MalformedResponse(String),
}

impl GenerationOutcome {
    /// The question text, or an empty string for any failure.
    pub fn into_question(self) -> String {
        match self {
            GenerationOutcome::Success(question) => question,
            _ => String::new(),
        }
    }
}

/// Absorbs completion-service variability: every call yields an outcome, never an error.
pub struct GenerationAdapter {
    service: Box<dyn CompletionService>,
}

impl GenerationAdapter {
    pub fn new(service: Box<dyn CompletionService>) -> Self {
        Self { service }
    }

    pub async fn generate(&self, prompt: &PromptRequest) -> GenerationOutcome {
        let style = prompt.style.style_id();
        match self.service.complete(&prompt.text).await {
            Ok(Completion::Text(raw)) => match normalize_question(&raw) {
                Some(question) => GenerationOutcome::Success(question),
                None => {
                    debug!(style, "completion had no usable line");
                    GenerationOutcome::MalformedResponse("completion had no text line".into())
                }
            },
            Ok(Completion::Blocked(reason)) => {
                warn!(style, reason = %reason, "completion blocked by safety policy");
                GenerationOutcome::Blocked(reason)
            }
            Err(SourceError::Malformed(reason)) => {
                warn!(style, reason = %reason, "unexpected completion response shape");
                GenerationOutcome::MalformedResponse(reason)
            }
            Err(err) => {
                error!(style, error = %err, "completion service error");
                GenerationOutcome::TransportFailure(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{build_prompts, QuestionStyle};
    use std::sync::Mutex;

    fn parse(raw: &str) -> GenerateContentResponse {
        serde_json::from_str(raw).expect("fixture json")
    }

    #[test]
    fn query_appends_optional_scope_filter() {
        assert_eq!(
            workflow_search_query(None),
            "path:.github/workflows extension:yml extension:yaml"
        );
        assert_eq!(
            workflow_search_query(Some("  stars:>10 ")),
            "path:.github/workflows extension:yml extension:yaml stars:>10"
        );
        assert_eq!(
            workflow_search_query(Some("   ")),
            workflow_search_query(None)
        );
    }

    #[test]
    fn search_items_map_to_candidates() {
        let parsed: CodeSearchResponse = serde_json::from_str(
            r#"{"items": [
                {"path": "a.yml", "url": "https://api/a", "html_url": "https://gh/a",
                 "repository": {"full_name": "octo/a"}},
                {"path": "b.yml", "url": "https://api/b"},
                {"url": "https://api/c"}
            ]}"#,
        )
        .unwrap();
        let candidates: Vec<_> = parsed.items.into_iter().filter_map(item_to_candidate).collect();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].identity(), "octo/a:a.yml");
        assert_eq!(candidates[0].display_url, "https://gh/a");
        assert_eq!(candidates[1].source_repo, "unknown");
        assert_eq!(candidates[1].display_url, "https://api/b");
    }

    #[test]
    fn decodes_wrapped_base64() {
        let encoded = "bmFtZTogQ0kKb246IHB1c2gK";
        let wrapped = format!("{}\n{}\n", &encoded[..12], &encoded[12..]);
        assert_eq!(
            decode_contents(&wrapped, Some("base64")).unwrap(),
            "name: CI\non: push\n"
        );
    }

    #[test]
    fn decodes_base64_with_missing_padding() {
        assert_eq!(decode_contents("b246IHA", None).unwrap(), "on: p");
        assert_eq!(decode_contents("b246IHA=", None).unwrap(), "on: p");
    }

    #[test]
    fn non_base64_encoding_passes_through_and_garbage_is_malformed() {
        assert_eq!(decode_contents("plain", Some("utf-8")).unwrap(), "plain");
        assert!(matches!(
            decode_contents("!!!not base64!!!", Some("base64")),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn gemini_text_parts_are_concatenated() {
        let resp = parse(
            r#"{"candidates": [{"content": {"parts": [{"text": "What triggers "}, {"text": "CI?"}]},
                "finishReason": "STOP"}]}"#,
        );
        assert_eq!(
            interpret_generate_response(resp).unwrap(),
            Completion::Text("What triggers CI?".into())
        );
    }

    #[test]
    fn gemini_safety_signals_are_blocked() {
        let prompt_blocked = parse(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#);
        assert!(matches!(
            interpret_generate_response(prompt_blocked),
            Ok(Completion::Blocked(_))
        ));

        let rating_blocked = parse(
            r#"{"candidates": [{"content": {"parts": [{"text": "x"}]},
                "safetyRatings": [{"category": "HARM_CATEGORY_HARASSMENT", "blocked": true}]}]}"#,
        );
        assert!(matches!(
            interpret_generate_response(rating_blocked),
            Ok(Completion::Blocked(_))
        ));

        let finish_blocked = parse(r#"{"candidates": [{"finishReason": "SAFETY"}]}"#);
        assert!(matches!(
            interpret_generate_response(finish_blocked),
            Ok(Completion::Blocked(_))
        ));
    }

    #[test]
    fn gemini_shapes_without_text_are_malformed() {
        assert!(matches!(
            interpret_generate_response(parse("{}")),
            Err(SourceError::Malformed(_))
        ));
        assert!(matches!(
            interpret_generate_response(parse(r#"{"candidates": [{"finishReason": "STOP"}]}"#)),
            Err(SourceError::Malformed(_))
        ));
    }

    struct ScriptedCompletion {
        replies: Mutex<Vec<Result<Completion, SourceError>>>,
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn complete(&self, _prompt: &str) -> Result<Completion, SourceError> {
            self.replies.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn adapter_normalizes_every_failure_shape() {
        let adapter = GenerationAdapter::new(Box::new(ScriptedCompletion {
            replies: Mutex::new(vec![
                Ok(Completion::Text("\n  Which jobs run in parallel?  \nextra".into())),
                Ok(Completion::Blocked("SAFETY".into())),
                Err(SourceError::Transport("connection reset".into())),
                Err(SourceError::Malformed("no candidates".into())),
                Ok(Completion::Text("   \n  ".into())),
            ]),
        }));
        let prompt = build_prompts("on: push", 1).remove(0);
        assert_eq!(prompt.style, QuestionStyle::Instruction);

        let first = adapter.generate(&prompt).await;
        assert_eq!(
            first,
            GenerationOutcome::Success("Which jobs run in parallel?".into())
        );
        assert!(matches!(
            adapter.generate(&prompt).await,
            GenerationOutcome::Blocked(_)
        ));
        assert!(matches!(
            adapter.generate(&prompt).await,
            GenerationOutcome::TransportFailure(_)
        ));
        assert!(matches!(
            adapter.generate(&prompt).await,
            GenerationOutcome::MalformedResponse(_)
        ));
        let empty = adapter.generate(&prompt).await;
        assert!(matches!(empty, GenerationOutcome::MalformedResponse(_)));
        assert_eq!(empty.into_question(), "");
    }
}
