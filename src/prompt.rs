//! Prompt templates and the matching response-extraction rule.

use std::{fmt, str::FromStr};

/// Fixed per-deployment wrapping applied to the user's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    /// Text is passed to the model unchanged.
    Raw,
    /// `Question: {text}\nAnswer:`
    #[default]
    QuestionAnswer,
    /// `Human: {text}\nAssistant:`
    HumanAssistant,
}

impl PromptTemplate {
    pub fn format(&self, text: &str) -> String {
        match self {
            PromptTemplate::Raw => text.to_string(),
            PromptTemplate::QuestionAnswer => format!("Question: {text}\nAnswer:"),
            PromptTemplate::HumanAssistant => format!("Human: {text}\nAssistant:"),
        }
    }

    /// Token that separates the echoed prompt from the model's answer.
    pub fn delimiter(&self) -> Option<&'static str> {
        match self {
            PromptTemplate::Raw => None,
            PromptTemplate::QuestionAnswer => Some("Answer:"),
            PromptTemplate::HumanAssistant => Some("Assistant:"),
        }
    }

    /// Returns the text after the first delimiter occurrence, or the whole
    /// decoded text when the delimiter is absent. Always trimmed.
    pub fn extract<'a>(&self, decoded: &'a str) -> &'a str {
        match self.delimiter().and_then(|d| decoded.split_once(d)) {
            Some((_, answer)) => answer.trim(),
            None => decoded.trim(),
        }
    }
}

impl FromStr for PromptTemplate {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "raw" | "none" => Ok(PromptTemplate::Raw),
            "question" | "qa" => Ok(PromptTemplate::QuestionAnswer),
            "human" | "chat" => Ok(PromptTemplate::HumanAssistant),
            other => Err(format!("unknown prompt template '{other}'")),
        }
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromptTemplate::Raw => "raw",
            PromptTemplate::QuestionAnswer => "question",
            PromptTemplate::HumanAssistant => "human",
        };
        f.write_str(name)
    }
}
