//! Failure diagnosis: static pattern table first, LLM second.

use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, prompt, truncate_for_prompt};

use super::strategy;

/// Where a diagnosis came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisSource {
    /// Matched the static pattern table.
    Pattern,
    /// Produced by the LLM.
    Llm,
    /// Nothing matched and the LLM was unavailable or malformed.
    Fallback,
}

/// Why an attempt failed and what to do about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    /// Pattern id, e.g. `missing_dependency`.
    pub pattern: String,
    /// Human-readable reason.
    pub reason: String,
    /// Correction strategy id, e.g. `add_dependency`.
    pub strategy: String,
    /// Where the diagnosis came from.
    pub source: DiagnosisSource,
}

impl Diagnosis {
    /// The safe default when nothing else applies.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            pattern: "unknown".to_string(),
            reason: "No known failure pattern matched".to_string(),
            strategy: strategy::RETRY.to_string(),
            source: DiagnosisSource::Fallback,
        }
    }
}

struct PatternRule {
    id: &'static str,
    keywords: &'static [&'static str],
    strategy: &'static str,
    reason: &'static str,
}

/// Checked in order; the first rule with a matching keyword wins.
const PATTERNS: &[PatternRule] = &[
    PatternRule {
        id: "missing_dependency",
        keywords: &[
            "cannot find module",
            "module not found",
            "no module named",
            "modulenotfounderror",
            "cannot find package",
        ],
        strategy: strategy::ADD_DEPENDENCY,
        reason: "A required package is not installed",
    },
    PatternRule {
        id: "invalid_parameters",
        keywords: &[
            "invalid parameter",
            "invalid params",
            "invalid argument",
            "missing required",
            "validation failed",
        ],
        strategy: strategy::REGENERATE_PARAMS,
        reason: "The step was called with invalid parameters",
    },
    PatternRule {
        id: "timeout",
        keywords: &["timed out", "timeout", "etimedout", "deadline exceeded"],
        strategy: strategy::INCREASE_TIMEOUT,
        reason: "The step did not finish in time",
    },
    PatternRule {
        id: "file_not_found",
        keywords: &["enoent", "no such file", "file not found"],
        strategy: strategy::CREATE_FILE,
        reason: "A file the step needs does not exist",
    },
    PatternRule {
        id: "network_error",
        keywords: &[
            "econnreset",
            "econnrefused",
            "enotfound",
            "network",
            "socket hang up",
            "fetch failed",
        ],
        strategy: strategy::RETRY_WITH_BACKOFF,
        reason: "A network request failed",
    },
    PatternRule {
        id: "resource_exhausted",
        keywords: &[
            "out of memory",
            "heap out of memory",
            "too many open files",
            "emfile",
            "resource exhausted",
            "quota exceeded",
        ],
        strategy: strategy::REDUCE_BATCH_SIZE,
        reason: "The step ran out of resources",
    },
    PatternRule {
        id: "syntax_error",
        keywords: &["syntaxerror", "syntax error", "unexpected token", "parse error"],
        strategy: strategy::REGENERATE_CODE,
        reason: "Generated code does not parse",
    },
];

/// Match error text against the static pattern table.
#[must_use]
pub fn match_pattern(error_text: &str) -> Option<Diagnosis> {
    let lower = error_text.to_lowercase();
    PATTERNS
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| lower.contains(k)))
        .map(|rule| Diagnosis {
            pattern: rule.id.to_string(),
            reason: rule.reason.to_string(),
            strategy: rule.strategy.to_string(),
            source: DiagnosisSource::Pattern,
        })
}

const DIAGNOSIS_SYSTEM_PROMPT: &str = "You diagnose failures of automated plan steps. \
Reply with JSON only: {\"pattern\": \"<snake_case id>\", \"reason\": \"<one sentence>\", \
\"strategy\": \"<one of: add_dependency, regenerate_params, increase_timeout, create_file, \
retry_with_backoff, reduce_batch_size, regenerate_code, retry>\"}.";

#[derive(Debug, Deserialize)]
struct DiagnosisReply {
    pattern: String,
    reason: String,
    strategy: String,
}

/// Diagnose a failed attempt from its error text.
///
/// Falls back to the LLM when no pattern matches, and to
/// [`Diagnosis::unknown`] when the LLM is unavailable or replies badly.
pub async fn diagnose(error_text: &str, llm: Option<&LlmClient>) -> Diagnosis {
    if let Some(diagnosis) = match_pattern(error_text) {
        return diagnosis;
    }

    let Some(llm) = llm else {
        return Diagnosis::unknown();
    };

    let user = format!(
        "The following errors occurred while executing a plan:\n{}",
        truncate_for_prompt(error_text, 4_000)
    );
    let reply: Option<DiagnosisReply> = llm
        .complete_json(prompt(DIAGNOSIS_SYSTEM_PROMPT, user), Some(0.0))
        .await;

    match reply {
        Some(reply)
            if !reply.pattern.trim().is_empty() && !reply.strategy.trim().is_empty() =>
        {
            Diagnosis {
                pattern: reply.pattern.trim().to_string(),
                reason: reply.reason,
                strategy: reply.strategy.trim().to_lowercase(),
                source: DiagnosisSource::Llm,
            }
        }
        _ => Diagnosis::unknown(),
    }
}
