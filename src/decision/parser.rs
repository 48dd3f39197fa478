//! Extraction of the machine-readable graph block from a model reply.
//!
//! Grammar: `reply-text START json END anything`. Only the first
//! START/END pair counts. The JSON between them is decoded strictly.

use regex::Regex;
use std::sync::OnceLock;

use super::types::GraphSuggestion;

pub const START_MARKER: &str = "<<<DECISION_GRAPH_JSON>>>";
pub const END_MARKER: &str = "<<<END_DECISION_GRAPH_JSON>>>";

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    /// Conversational text preceding the block.
    pub reply: String,
    pub suggestion: GraphSuggestion,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseFailure {
    #[error("no decision graph block in reply")]
    MissingBlock,
    #[error("decision graph block is not valid: {0}")]
    InvalidJson(String),
}

fn block_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            let pattern = format!(
                r"(?s){}(.*?){}",
                regex::escape(START_MARKER),
                regex::escape(END_MARKER)
            );
            Regex::new(&pattern).ok()
        })
        .as_ref()
}

/// Drops a Markdown code fence the model may have put around the JSON.
fn strip_fence(block: &str) -> &str {
    let trimmed = block.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub fn parse_reply(text: &str) -> Result<ParsedReply, ParseFailure> {
    let captures = block_pattern()
        .and_then(|re| re.captures(text))
        .ok_or(ParseFailure::MissingBlock)?;

    let (Some(whole), Some(body)) = (captures.get(0), captures.get(1)) else {
        return Err(ParseFailure::MissingBlock);
    };

    let suggestion: GraphSuggestion = serde_json::from_str(strip_fence(body.as_str()))
        .map_err(|e| ParseFailure::InvalidJson(e.to_string()))?;

    Ok(ParsedReply {
        reply: text[..whole.start()].to_string(),
        suggestion,
    })
}
