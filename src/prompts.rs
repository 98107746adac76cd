use std::collections::HashMap;

use crate::error::{Error, Result};

/// Known template variable names for validation.
const KNOWN_VARIABLES: &[&str] = &[
    "agent_name",
    "agent_focus",
    "pass_index",
    "pass_count",
    "target_path",
    "review_report",
];

/// Output contract shared by every built-in review prompt. The merger's
/// finding extraction relies on this shape.
pub const FINDINGS_FORMAT: &str = r#"Report each finding as its own block, most severe first:

### <n>. [<Critical|High|Medium|Low>] <one-line title>
**Location:** <path>:<line>

<explanation and suggested fix>

If you find nothing worth reporting, reply with exactly NO_ISSUES_FOUND."#;

pub const DEFAULT_REVIEW_PROMPT: &str = r#"You are the {{agent_name}} reviewer.
Review the code in {{target_path}} with a focus on {{agent_focus}}.
This is independent review pass {{pass_index}} of {{pass_count}}; do not assume other passes exist.
Do not modify any files.

"#;

pub const DEFAULT_SUMMARY_PROMPT: &str = r#"You are summarizing a multi-agent code review of {{target_path}}.
Below are the merged findings of every reviewer. Write a short executive summary:
the overall risk, the three most important issues, and what to fix first.

{{review_report}}
"#;

/// Render a template string by substituting `{{variable}}` placeholders.
/// Errors on unknown variables (strict mode).
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            let mut found_close = false;

            while let Some(c2) = chars.next() {
                if c2 == '}' && chars.peek() == Some(&'}') {
                    chars.next();
                    found_close = true;
                    break;
                }
                var_name.push(c2);
            }

            if !found_close {
                return Err(Error::Prompt(format!(
                    "unclosed template variable: {{{{{var_name}"
                )));
            }

            let var_name = var_name.trim();
            if !KNOWN_VARIABLES.contains(&var_name) {
                return Err(Error::Prompt(format!(
                    "unknown template variable: {var_name}"
                )));
            }

            match vars.get(var_name) {
                Some(value) => result.push_str(value),
                None => {
                    return Err(Error::Prompt(format!(
                        "missing value for template variable: {var_name}"
                    )));
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

/// Check that a template only references known variables, without rendering it.
pub fn validate_template(template: &str) -> Result<()> {
    let vars: HashMap<String, String> = KNOWN_VARIABLES
        .iter()
        .map(|v| (v.to_string(), String::new()))
        .collect();
    render_template(template, &vars).map(|_| ())
}

/// Variables filled in only for the summary step.
const SUMMARY_ONLY_VARIABLES: &[&str] = &["review_report"];

/// [`validate_template`] for a per-agent review prompt, which never receives
/// the summary-only variables.
pub fn validate_agent_template(template: &str) -> Result<()> {
    validate_template(template)?;
    for name in SUMMARY_ONLY_VARIABLES {
        let vars: HashMap<String, String> = KNOWN_VARIABLES
            .iter()
            .filter(|v| *v != name)
            .map(|v| (v.to_string(), String::new()))
            .collect();
        if render_template(template, &vars).is_err() {
            return Err(Error::Prompt(format!(
                "{name} is only available to the summary prompt"
            )));
        }
    }
    Ok(())
}

/// Append the findings output contract unless the template already carries it.
pub fn with_findings_format(template: &str) -> String {
    if template.contains("NO_ISSUES_FOUND") {
        template.to_string()
    } else {
        format!("{}\n\n{FINDINGS_FORMAT}\n", template.trim_end())
    }
}
