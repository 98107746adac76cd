//! Consolidates per-pass results into one result per agent.
//!
//! Findings from every successful pass are folded together in two stages.
//! First, findings pointing at the same normalized location are the same
//! finding regardless of wording. Otherwise two findings are only folded when
//! they share a non-trivial keyword *and* their character-bigram Jaccard
//! similarity is above the threshold. Either signal alone is not enough.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::dispatcher::{ReviewResult, now_millis};
use crate::findings::{Finding, extract_findings, reports_no_findings};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Merged content for an agent whose passes all came back empty.
pub const NO_FINDINGS_MESSAGE: &str = "No issues found.";

const MIN_KEYWORD_LEN: usize = 4;

/// Words too common in review prose to show two findings are related.
const STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "into", "when", "then", "than", "there", "their", "these",
    "those", "which", "while", "where", "should", "could", "would", "will", "must", "does",
    "have", "been", "being", "were", "also", "only", "more", "most", "some", "same", "each",
    "other", "about", "after", "before", "because", "without", "within", "line", "file",
    "code", "function", "method", "value", "issue", "problem", "missing", "possible",
    "potential", "using", "used", "uses", "call", "calls",
];

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

pub struct ResultMerger {
    similarity_threshold: f64,
}

impl Default for ResultMerger {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl ResultMerger {
    /// Thresholds outside (0, 1] fall back to the default.
    pub fn new(similarity_threshold: f64) -> Self {
        let similarity_threshold = if similarity_threshold > 0.0 && similarity_threshold <= 1.0 {
            similarity_threshold
        } else {
            DEFAULT_SIMILARITY_THRESHOLD
        };
        Self {
            similarity_threshold,
        }
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Produce exactly one result per distinct agent, in first-appearance order.
    pub fn merge(&self, results: Vec<ReviewResult>) -> Vec<ReviewResult> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<ReviewResult>> = HashMap::new();
        for result in results {
            if !groups.contains_key(&result.agent_id) {
                order.push(result.agent_id.clone());
            }
            groups.entry(result.agent_id.clone()).or_default().push(result);
        }

        order
            .into_iter()
            .filter_map(|agent_id| {
                let passes = groups.remove(&agent_id)?;
                Some(self.merge_agent(&agent_id, passes))
            })
            .collect()
    }

    fn merge_agent(&self, agent_id: &str, mut passes: Vec<ReviewResult>) -> ReviewResult {
        passes.sort_by_key(|r| r.pass_index.unwrap_or(0));
        let pass_count = passes.len();
        let attempts: u32 = passes.iter().map(|r| r.attempts).sum();
        let (successes, failures): (Vec<ReviewResult>, Vec<ReviewResult>) =
            passes.into_iter().partition(|r| r.success);

        if successes.is_empty() {
            debug!(agent = agent_id, passes = pass_count, "every pass failed");
            let mut last = failures
                .into_iter()
                .last()
                .unwrap_or_else(|| ReviewResult::failure(agent_id, 0, "no passes ran"));
            last.pass_index = None;
            last.attempts = attempts;
            return last;
        }

        let per_pass: Vec<Vec<Finding>> = successes
            .iter()
            .map(|r| {
                let content = r.content.as_deref().unwrap_or("");
                extract_findings(content, r.pass_index.unwrap_or(0))
            })
            .collect();
        let extracted: usize = per_pass.iter().map(Vec::len).sum();
        let findings = self.dedupe(per_pass);

        debug!(
            agent = agent_id,
            extracted,
            merged = findings.len(),
            failed_passes = failures.len(),
            "merged pass findings"
        );

        let mut content = if !findings.is_empty() {
            findings
                .iter()
                .enumerate()
                .map(|(i, f)| f.render(i + 1, pass_count > 1))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            // Output with no recognizable finding blocks is kept verbatim rather
            // than discarded.
            successes
                .iter()
                .rev()
                .filter_map(|r| r.content.as_deref())
                .find(|c| !c.trim().is_empty() && !reports_no_findings(c))
                .map(|c| c.trim_end().to_string())
                .unwrap_or_else(|| NO_FINDINGS_MESSAGE.to_string())
        };

        if !failures.is_empty() {
            content.push_str(&format!(
                "\n\n> Note: {} pass(es) failed and were excluded from this merge.\n",
                failures.len()
            ));
        }

        ReviewResult {
            agent_id: agent_id.to_string(),
            pass_index: None,
            success: true,
            content: Some(content),
            error_message: None,
            timestamp: successes
                .iter()
                .map(|r| r.timestamp)
                .max()
                .unwrap_or_else(now_millis),
            attempts,
            findings,
        }
    }

    /// Fold findings across passes, keeping first-seen order. A finding is
    /// never folded into one from the same pass.
    pub fn dedupe(&self, per_pass: Vec<Vec<Finding>>) -> Vec<Finding> {
        let mut merged: Vec<Finding> = Vec::new();
        for finding in per_pass.into_iter().flatten() {
            match self.find_duplicate(&merged, &finding) {
                Some(idx) => merged[idx] = merged[idx].folded_with(&finding),
                None => merged.push(finding),
            }
        }
        merged
    }

    fn find_duplicate(&self, merged: &[Finding], finding: &Finding) -> Option<usize> {
        let eligible = |existing: &Finding| existing.source_passes.is_disjoint(&finding.source_passes);
        let location = finding.location.as_deref().map(normalize_location);

        if let Some(ref location) = location {
            let exact = merged.iter().position(|existing| {
                eligible(existing)
                    && existing.location.as_deref().map(normalize_location).as_ref() == Some(location)
            });
            if exact.is_some() {
                return exact;
            }
        }

        merged.iter().position(|existing| {
            if !eligible(existing) {
                return false;
            }
            if let (Some(a), Some(b)) = (existing.location.as_deref(), location.as_deref())
                && normalize_location(a) != b
            {
                return false;
            }
            self.is_similar(existing, finding)
        })
    }

    pub fn is_similar(&self, a: &Finding, b: &Finding) -> bool {
        let a = normalize_text(&format!("{} {}", a.title, a.summary()));
        let b = normalize_text(&format!("{} {}", b.title, b.summary()));
        shares_keyword(&a, &b) && bigram_similarity(&a, &b) > self.similarity_threshold
    }
}

/// Lowercase, drop backticks, use forward slashes, strip a leading `./` and
/// collapse whitespace.
pub fn normalize_location(location: &str) -> String {
    let cleaned = location.trim().replace('`', "").replace('\\', "/").to_lowercase();
    let cleaned = cleaned.trim_start_matches("./");
    WHITESPACE_RE.replace_all(cleaned, " ").into_owned()
}

/// Lowercase, strip Markdown emphasis markers and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '~'))
        .collect::<String>()
        .to_lowercase();
    WHITESPACE_RE.replace_all(stripped.trim(), " ").into_owned()
}

fn keywords(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN && !STOPWORDS.contains(w))
        .collect()
}

fn shares_keyword(a: &str, b: &str) -> bool {
    let a = keywords(a);
    keywords(b).iter().any(|w| a.contains(w))
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Jaccard similarity of the two strings' character-bigram sets.
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a = bigrams(a);
    let b = bigrams(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}
