//! Core domain model, prompt templates and question normalization for the harvester.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "harvest-core";

/// Hard cap on the length (in characters) of a persisted question.
pub const MAX_QUESTION_CHARS: usize = 400;

const ELLIPSIS: &str = "...";

/// A search hit that may be harvested. Transient: built per page during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    pub source_repo: String,
    pub path: String,
    /// Opaque handle handed back to the content source (the contents API URL for GitHub).
    pub content_ref: String,
    pub display_url: String,
}

impl CandidateDescriptor {
    /// Dedup key, stable across runs for the same document.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.source_repo, self.path)
    }
}

/// Which prompt template produced a question. Serialized by template position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestionStyle {
    #[serde(rename = "style_1")]
    Instruction,
    #[serde(rename = "style_2")]
    Trigger,
    #[serde(rename = "style_3")]
    Parallelism,
    #[serde(rename = "style_4")]
    SecretsEnvCaching,
    #[serde(rename = "style_5")]
    Purpose,
}

impl QuestionStyle {
    /// Template order. Position `i` serializes as `style_{i+1}`.
    pub const ALL: [QuestionStyle; 5] = [
        QuestionStyle::Instruction,
        QuestionStyle::Trigger,
        QuestionStyle::Parallelism,
        QuestionStyle::SecretsEnvCaching,
        QuestionStyle::Purpose,
    ];

    pub fn style_id(self) -> &'static str {
        match self {
            QuestionStyle::Instruction => "style_1",
            QuestionStyle::Trigger => "style_2",
            QuestionStyle::Parallelism => "style_3",
            QuestionStyle::SecretsEnvCaching => "style_4",
            QuestionStyle::Purpose => "style_5",
        }
    }

    fn request(self) -> &'static str {
        match self {
            QuestionStyle::Instruction => {
                "Generate exactly one concise single-sentence INSTRUCTION (no answer) that asks a model\n\
                 to produce a GitHub Actions workflow that performs the same tasks as the given YAML.\n\
                 Keep it short (<= 30 words). Output only the instruction sentence."
            }
            QuestionStyle::Trigger => {
                "Generate exactly one concise single-sentence question (no answer) asking what triggers this workflow.\n\
                 Keep it short (<= 30 words). Output only the question."
            }
            QuestionStyle::Parallelism => {
                "Generate exactly one concise single-sentence question (no answer) asking which jobs or steps run in parallel or depend on others.\n\
                 Keep it short (<= 30 words). Output only the question."
            }
            QuestionStyle::SecretsEnvCaching => {
                "Generate exactly one concise single-sentence question (no answer) about how environment variables, secrets, or caching/artifacts are used.\n\
                 Keep it short (<= 30 words). Output only the question."
            }
            QuestionStyle::Purpose => {
                "Generate exactly one concise single-sentence question (no answer) that asks for a short description of the workflow's purpose or main effect.\n\
                 Keep it short (<= 30 words). Output only the question."
            }
        }
    }

    fn answer_label(self) -> &'static str {
        match self {
            QuestionStyle::Instruction => "Instruction:",
            _ => "Question:",
        }
    }

    /// Renders the full prompt with `document` interpolated verbatim.
    pub fn render(self, document: &str) -> String {
        format!(
            "You will be given the contents of a GitHub Actions workflow YAML file.\n\
             {}\n\n\
             --- WORKFLOW START ---\n{}\n--- WORKFLOW END ---\n\n\
             {}",
            self.request(),
            document,
            self.answer_label()
        )
    }
}

/// One generation request derived from a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub style: QuestionStyle,
    pub text: String,
}

/// Builds up to `requested` prompts for `document`, in template order.
pub fn build_prompts(document: &str, requested: usize) -> Vec<PromptRequest> {
    QuestionStyle::ALL
        .iter()
        .take(requested)
        .map(|style| PromptRequest {
            style: *style,
            text: style.render(document),
        })
        .collect()
}

/// Reduces a raw completion to a single persisted question line.
///
/// Takes the first line with visible content, trims it, and caps it at
/// [`MAX_QUESTION_CHARS`]. An over-long line is cut at the last whitespace that
/// keeps room for the ellipsis, so no word is split; a line with no such
/// whitespace is hard-cut. Returns `None` when nothing usable remains.
pub fn normalize_question(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    if line.chars().count() <= MAX_QUESTION_CHARS {
        return Some(line.to_string());
    }

    let keep = MAX_QUESTION_CHARS - ELLIPSIS.len();
    // Cutting at whitespace inside the first `keep + 1` chars leaves at most `keep`.
    let boundary = line
        .char_indices()
        .take(keep + 1)
        .filter(|(_, c)| c.is_whitespace())
        .map(|(idx, _)| idx)
        .last();

    let head = match boundary {
        Some(idx) => line[..idx].trim_end(),
        None => {
            let cut = line
                .char_indices()
                .nth(keep)
                .map(|(idx, _)| idx)
                .unwrap_or(line.len());
            &line[..cut]
        }
    };
    Some(format!("{head}{ELLIPSIS}"))
}

/// Persisted output unit: one generated question paired with the raw document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub question: String,
    pub answer: String,
    pub source: String,
    pub path: String,
    pub url: String,
    pub retrieved_at: DateTime<Utc>,
    pub question_style: QuestionStyle,
}

impl HarvestRecord {
    pub fn new(
        candidate: &CandidateDescriptor,
        question: String,
        document: String,
        style: QuestionStyle,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            question,
            answer: document,
            source: candidate.source_repo.clone(),
            path: candidate.path.clone(),
            url: candidate.display_url.clone(),
            retrieved_at,
            question_style: style,
        }
    }

    pub fn identity(&self) -> String {
        format!("{}:{}", self.source, self.path)
    }
}
