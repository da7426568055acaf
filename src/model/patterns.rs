//! Phrase-matching entity model loaded from an entity-ruler pattern file.
//!
//! Each line of the file is a JSON object `{"label": .., "pattern": ..}` where the
//! pattern is either a phrase string (matched case-sensitively) or a list of token
//! objects keyed by `ORTH`/`TEXT` (case-sensitive) or `LOWER` (case-insensitive). Case
//! folding applies per token, so `ORTH` tokens stay exact next to `LOWER` ones.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::model::EntityModel;
use crate::record::Entity;

const MATCHER_SIZE_LIMIT: usize = 256 * 1024 * 1024;

/// Whole-word, longest-first, non-overlapping phrase matcher.
#[derive(Debug, Clone)]
pub struct PatternModel {
    matcher: Option<Regex>,
    labels: Vec<String>,
}

/// A labelled sequence of whitespace-separated tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// Entity label.
    pub label: String,
    /// Tokens to match, in order.
    pub tokens: Vec<PatternToken>,
}

/// One token of a [`Pattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternToken {
    /// Token text.
    pub text: String,
    /// Whether this token matches regardless of case.
    pub ignore_case: bool,
}

#[derive(Deserialize)]
struct PatternLine {
    label: String,
    pattern: Value,
}

impl PatternModel {
    /// Loads patterns from a JSONL file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let location = path.display().to_string();
        let file = File::open(path).map_err(|err| PipelineError::model_load(&location, err))?;
        let reader = BufReader::new(file);
        let mut patterns = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|err| PipelineError::model_load(&location, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: PatternLine = serde_json::from_str(&line).map_err(|err| {
                PipelineError::model_load(&location, format!("line {}: {err}", line_no + 1))
            })?;
            let pattern = Pattern::from_value(parsed.label, &parsed.pattern).map_err(|reason| {
                PipelineError::model_load(&location, format!("line {}: {reason}", line_no + 1))
            })?;
            patterns.push(pattern);
        }
        tracing::debug!(patterns = patterns.len(), path = %location, "loaded entity patterns");
        Self::new(patterns).map_err(|err| PipelineError::model_load(&location, err))
    }

    /// Builds a matcher from in-memory patterns.
    pub fn new(patterns: Vec<Pattern>) -> Result<Self> {
        let mut patterns: Vec<Pattern> = patterns
            .into_iter()
            .filter(|p| !p.tokens.is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(Self {
                matcher: None,
                labels: Vec::new(),
            });
        }
        // Leftmost-first alternation: at a given start, the first listed pattern wins.
        patterns.sort_by_key(|p| std::cmp::Reverse(p.char_len()));

        let alternatives: Vec<String> = patterns.iter().map(Pattern::to_regex).collect();
        let matcher = RegexBuilder::new(&alternatives.join("|"))
            .size_limit(MATCHER_SIZE_LIMIT)
            .build()
            .map_err(|err| PipelineError::Configuration(format!("invalid entity patterns: {err}")))?;
        Ok(Self {
            matcher: Some(matcher),
            labels: patterns.into_iter().map(|p| p.label).collect(),
        })
    }

    /// Number of usable patterns.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the model has no patterns (and therefore never finds anything).
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn find(&self, text: &str) -> Vec<Entity> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };
        let mut entities = Vec::new();
        let mut byte_cursor = 0usize;
        let mut char_cursor = 0usize;
        for caps in matcher.captures_iter(text) {
            let Some((group, m)) = caps
                .iter()
                .skip(1)
                .enumerate()
                .find_map(|(idx, m)| m.map(|m| (idx, m)))
            else {
                continue;
            };
            char_cursor += text[byte_cursor..m.start()].chars().count();
            let start = char_cursor;
            let end = start + m.as_str().chars().count();
            char_cursor = end;
            byte_cursor = m.end();
            entities.push(Entity::new(m.as_str(), self.labels[group].as_str(), start, end));
        }
        entities
    }
}

impl EntityModel for PatternModel {
    fn extract(&mut self, texts: &[&str]) -> Result<Vec<Vec<Entity>>> {
        Ok(texts.iter().map(|text| self.find(text)).collect())
    }
}

impl Pattern {
    /// Builds a case-sensitive phrase pattern.
    pub fn phrase(label: impl Into<String>, phrase: &str) -> Self {
        Self {
            label: label.into(),
            tokens: phrase
                .split_whitespace()
                .map(|word| PatternToken {
                    text: word.to_string(),
                    ignore_case: false,
                })
                .collect(),
        }
    }

    fn from_value(label: String, pattern: &Value) -> std::result::Result<Self, String> {
        match pattern {
            Value::String(phrase) => Ok(Self::phrase(label, phrase)),
            Value::Array(tokens) => {
                let mut parsed = Vec::with_capacity(tokens.len());
                for token in tokens {
                    let (word, ignore_case) =
                        if let Some(word) = token.get("LOWER").and_then(Value::as_str) {
                            (word, true)
                        } else if let Some(word) = token
                            .get("ORTH")
                            .or_else(|| token.get("TEXT"))
                            .and_then(Value::as_str)
                        {
                            (word, false)
                        } else {
                            return Err(format!("unsupported token pattern {token}"));
                        };
                    parsed.extend(word.split_whitespace().map(|part| PatternToken {
                        text: part.to_string(),
                        ignore_case,
                    }));
                }
                Ok(Self {
                    label,
                    tokens: parsed,
                })
            }
            other => Err(format!("pattern must be a string or token list, got {other}")),
        }
    }

    /// Length in characters of the phrase with single spaces between tokens.
    fn char_len(&self) -> usize {
        let words: usize = self.tokens.iter().map(|t| t.text.chars().count()).sum();
        words + self.tokens.len().saturating_sub(1)
    }

    fn to_regex(&self) -> String {
        let body = self
            .tokens
            .iter()
            .map(|token| {
                let escaped = regex::escape(&token.text);
                if token.ignore_case {
                    format!("(?i:{escaped})")
                } else {
                    escaped
                }
            })
            .collect::<Vec<_>>()
            .join(r"\s+");
        let first = self.tokens.first().and_then(|t| t.text.chars().next());
        let last = self.tokens.last().and_then(|t| t.text.chars().last());
        let leading = if first.is_some_and(is_word_char) { r"\b" } else { "" };
        let trailing = if last.is_some_and(is_word_char) { r"\b" } else { "" };
        format!("({leading}{body}{trailing})")
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
