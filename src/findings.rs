//! Structured findings extracted from a pass's free-text review output.
//!
//! A finding is a block opened by a Markdown heading or a numbered line,
//! carrying a priority marker either in the opening line (`[High]`,
//! `(critical)`, `Priority: low`) or in a `Priority:` / `Severity:` line of
//! its body. An optional `Location:` / `File:` line gives the path reference.
//! Blocks without any priority marker are prose, not findings.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Sentinel a reviewer prints when it has nothing to report.
pub const NO_FINDINGS_SENTINEL: &str = "NO_ISSUES_FOUND";

/// Priority of a finding. Variants are ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl Priority {
    pub fn parse(word: &str) -> Priority {
        match word.trim().to_lowercase().as_str() {
            "critical" | "blocker" | "p0" => Priority::Critical,
            "high" | "major" | "p1" => Priority::High,
            "medium" | "moderate" | "p2" => Priority::Medium,
            "low" | "minor" | "nit" | "info" | "p3" => Priority::Low,
            _ => Priority::Unknown,
        }
    }

    /// The more severe of the two.
    pub fn max_severity(self, other: Priority) -> Priority {
        self.min(other)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "Critical"),
            Priority::High => write!(f, "High"),
            Priority::Medium => write!(f, "Medium"),
            Priority::Low => write!(f, "Low"),
            Priority::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub title: String,
    pub priority: Priority,
    pub body: String,
    pub location: Option<String>,
    /// Passes that reported this finding.
    pub source_passes: BTreeSet<u32>,
}

impl Finding {
    pub fn new(title: impl Into<String>, priority: Priority, pass_index: u32) -> Self {
        Self {
            title: title.into(),
            priority,
            body: String::new(),
            location: None,
            source_passes: BTreeSet::from([pass_index]),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// First non-empty line of the body.
    pub fn summary(&self) -> &str {
        self.body
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }

    /// Fold a duplicate into this finding. Title, body and location of `self`
    /// win; passes are unioned and the more severe priority is kept.
    pub fn folded_with(&self, duplicate: &Finding) -> Finding {
        Finding {
            title: self.title.clone(),
            priority: self.priority.max_severity(duplicate.priority),
            body: self.body.clone(),
            location: self.location.clone().or_else(|| duplicate.location.clone()),
            source_passes: self
                .source_passes
                .union(&duplicate.source_passes)
                .copied()
                .collect(),
        }
    }

    pub fn provenance(&self) -> String {
        let passes: Vec<String> = self.source_passes.iter().map(u32::to_string).collect();
        format!("detected in passes: {}", passes.join(", "))
    }

    /// Render as a numbered Markdown block in the same shape extraction reads.
    pub fn render(&self, number: usize, with_provenance: bool) -> String {
        let mut out = format!("### {number}. [{}] {}\n", self.priority, self.title);
        if let Some(ref location) = self.location {
            out.push_str(&format!("**Location:** `{location}`\n"));
        }
        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
            out.push('\n');
        }
        if with_provenance {
            out.push_str(&format!("\n_{}_\n", self.provenance()));
        }
        out
    }
}

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.*\S)\s*$").expect("valid regex"));
static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s{0,3}(?:\*\*)?\d{1,3}[.)]\s+(.*\S)\s*$").expect("valid regex")
});
static LEADING_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\*\*)?\d{1,3}[.)]\s*").expect("valid regex"));
static PRIORITY_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)[\[(]\s*(critical|blocker|high|major|medium|moderate|low|minor|nit|info|p[0-3])\s*[\])]",
    )
    .expect("valid regex")
});
static INLINE_PRIORITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:priority|severity)\s*[:=]\s*\**\s*([a-z0-9]+)\**").expect("valid regex")
});
static META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?\**(priority|severity|location|file)\**\s*:\s*\**\s*(.*?)\s*$")
        .expect("valid regex")
});
static PROVENANCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*_?detected in passes:").expect("valid regex"));

#[derive(Debug, Default)]
struct Candidate {
    header: String,
    priority: Option<Priority>,
    location: Option<String>,
    body: Vec<String>,
}

impl Candidate {
    fn open(header: &str) -> Self {
        let header = LEADING_NUMBER_RE.replace(header.trim(), "").to_string();
        let priority = PRIORITY_TAG_RE
            .captures(&header)
            .or_else(|| INLINE_PRIORITY_RE.captures(&header))
            .map(|c| Priority::parse(&c[1]));
        Self {
            header,
            priority,
            ..Default::default()
        }
    }

    fn into_finding(self, pass_index: u32) -> Option<Finding> {
        let priority = self.priority?;
        let title = clean_title(&self.header);
        if title.is_empty() {
            return None;
        }
        let body = self.body.join("\n").trim().to_string();
        let mut finding = Finding::new(title, priority, pass_index).with_body(body);
        finding.location = self.location.filter(|l| !l.is_empty());
        Some(finding)
    }
}

/// True when the whole reply is the sentinel.
pub fn is_no_findings(content: &str) -> bool {
    content.trim().trim_matches(['`', '*', '.']) == NO_FINDINGS_SENTINEL
}

/// True when a reply says it found nothing: the sentinel alone, the sentinel
/// on a line of its own, or an opening "no issues found" / "no findings"
/// statement. Only meaningful for replies with no extractable findings.
pub fn reports_no_findings(content: &str) -> bool {
    if is_no_findings(content) || content.lines().any(is_no_findings) {
        return true;
    }
    let lower = content.trim().to_lowercase();
    lower.starts_with("no issues found") || lower.starts_with("no findings")
}

/// Extract findings from one pass's content, in order of appearance. A reply
/// with no finding blocks, including the sentinel, yields nothing.
pub fn extract_findings(content: &str, pass_index: u32) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut current: Option<Candidate> = None;

    for line in content.lines() {
        if PROVENANCE_RE.is_match(line) {
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(line) {
            findings.extend(current.take().and_then(|c| c.into_finding(pass_index)));
            current = Some(Candidate::open(&caps[1]));
            continue;
        }

        if let Some(caps) = NUMBERED_RE.captures(line) {
            let has_tag = PRIORITY_TAG_RE.is_match(&caps[1]);
            if current.is_none() || has_tag {
                findings.extend(current.take().and_then(|c| c.into_finding(pass_index)));
                current = Some(Candidate::open(&caps[1]));
                continue;
            }
        }

        let Some(cand) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = META_RE.captures(line) {
            let key = caps[1].to_lowercase();
            let value = caps[2].trim_matches(|c| c == '*' || c == ' ');
            match key.as_str() {
                "priority" | "severity" if cand.priority.is_none() => {
                    cand.priority = Some(Priority::parse(value.trim_matches(['[', ']'])));
                    continue;
                }
                "location" | "file" if cand.location.is_none() => {
                    cand.location = Some(value.trim_matches('`').to_string());
                    continue;
                }
                _ => {}
            }
        }

        cand.body.push(line.to_string());
    }

    findings.extend(current.and_then(|c| c.into_finding(pass_index)));
    findings
}

fn clean_title(header: &str) -> String {
    let without_tag = PRIORITY_TAG_RE.replace_all(header, "");
    let without_inline = INLINE_PRIORITY_RE.replace_all(&without_tag, "");
    let unemphasized = without_inline.replace("**", "").replace("__", "");
    unemphasized
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | ':' | '|' | '—'))
        .to_string()
}
