use std::collections::BTreeSet;

use crate::notify::report::ReportDigest;

/// Content beyond this many chars is not sent for analysis.
pub const MAX_ANALYSIS_CHARS: usize = 8_000;

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a research monitoring analyst. You judge whether newly detected content is significant enough to notify a researcher about.

Weigh:
- Novelty and importance of the information
- Presence of the researcher's keywords
- Technical depth and research value
- Business impact or market relevance

Respond with a single JSON object and nothing else:
{"score": <number from 0.0 to 1.0>, "summary": "<two or three sentences on why this matters or does not>"}

1.0 means extremely significant and newsworthy. Routine edits, boilerplate and navigation changes score below 0.2."#;

pub const REPORT_SYSTEM_PROMPT: &str = r#"You write short research briefings from monitoring statistics. Use only the data you are given. Write markdown with these sections:

## Key Trends
## Notable Findings
## Patterns
## Recommended Follow-up

Keep the whole briefing under 400 words. Do not repeat the raw statistics table."#;

pub fn analysis_prompt(text: &str, keywords: &BTreeSet<String>) -> String {
    let content: String = text.chars().take(MAX_ANALYSIS_CHARS).collect();
    let focus = if keywords.is_empty() {
        String::new()
    } else {
        let list: Vec<&str> = keywords.iter().map(String::as_str).collect();
        format!("Pay special attention to content related to: {}\n\n", list.join(", "))
    };
    format!("{focus}Content:\n{content}")
}

pub fn report_prompt(digest: &ReportDigest) -> String {
    let data = serde_json::to_string_pretty(digest).unwrap_or_default();
    format!(
        "Findings from the last {} hours:\n\n{}",
        digest.window_hours, data
    )
}
