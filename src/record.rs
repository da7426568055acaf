//! Records flowing through the extraction pipeline, from raw rows to output lines.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Loosely typed row as produced by a row source: field name to JSON value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Part of a page entities are extracted from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagePart {
    /// Page title, one row per page.
    Title,
    /// Page description, one row per page.
    Description,
    /// Page body text, one row per line.
    Text,
}

impl PagePart {
    /// Stable lowercase name used in table and file names.
    pub fn as_str(self) -> &'static str {
        match self {
            PagePart::Title => "title",
            PagePart::Description => "description",
            PagePart::Text => "text",
        }
    }

    /// Whether output records for this part carry a line number.
    pub fn has_line_numbers(self) -> bool {
        matches!(self, PagePart::Text)
    }
}

impl fmt::Display for PagePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PagePart {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "title" => Ok(PagePart::Title),
            "description" => Ok(PagePart::Description),
            "text" => Ok(PagePart::Text),
            other => Err(PipelineError::config(format!(
                "invalid part of page `{other}` (expected title, description or text)"
            ))),
        }
    }
}

/// Typed input record, one variant per page part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Title row.
    Title {
        /// Correlation key.
        page_id: String,
        /// Title text, `None` when null or missing.
        title: Option<String>,
    },
    /// Description row.
    Description {
        /// Correlation key.
        page_id: String,
        /// Description text, `None` when null or missing.
        description: Option<String>,
    },
    /// One line of body text.
    Text {
        /// Correlation key.
        page_id: String,
        /// Position of the line within the page body.
        line_number: Option<i64>,
        /// Line text, `None` when null or missing.
        line: Option<String>,
    },
}

impl Record {
    /// Converts the record into a model-ready unit; null text becomes the empty string.
    pub fn into_unit(self) -> Unit {
        match self {
            Record::Title { page_id, title } => Unit::new(title.unwrap_or_default(), page_id, None),
            Record::Description {
                page_id,
                description,
            } => Unit::new(description.unwrap_or_default(), page_id, None),
            Record::Text {
                page_id,
                line_number,
                line,
            } => Unit::new(line.unwrap_or_default(), page_id, line_number),
        }
    }
}

/// Metadata carried alongside a unit through inference, untouched by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMeta {
    /// Correlation key.
    pub page_id: String,
    /// Line position, present for body text.
    pub line_number: Option<i64>,
}

/// Text submitted to the model plus the metadata needed to correlate its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// Exact text the model sees; entity offsets refer to it.
    pub text: String,
    /// Pass-through metadata.
    pub meta: UnitMeta,
}

impl Unit {
    /// Builds a unit.
    pub fn new(text: impl Into<String>, page_id: impl Into<String>, line_number: Option<i64>) -> Self {
        Self {
            text: text.into(),
            meta: UnitMeta {
                page_id: page_id.into(),
                line_number,
            },
        }
    }
}

/// Labelled span extracted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Surface text of the span.
    pub name: String,
    /// Entity label (e.g. `GPE`, `ORG`).
    #[serde(rename = "type")]
    pub label: String,
    /// Start character offset (inclusive).
    pub start: usize,
    /// End character offset (exclusive).
    pub end: usize,
}

impl Entity {
    /// Builds an entity span.
    pub fn new(name: impl Into<String>, label: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            start,
            end,
        }
    }
}

/// One line of the extraction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Correlation key of the source page.
    pub page_id: String,
    /// Entities found in the unit's text, in model order.
    pub entities: Vec<Entity>,
    /// Line position, present only for body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_part_names() {
        assert_eq!("title".parse::<PagePart>().unwrap(), PagePart::Title);
        assert_eq!(" text ".parse::<PagePart>().unwrap(), PagePart::Text);
        assert!(matches!(
            "body".parse::<PagePart>(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn null_text_becomes_empty_unit() {
        let record = Record::Text {
            page_id: "/a".into(),
            line_number: Some(3),
            line: None,
        };
        let unit = record.into_unit();
        assert_eq!(unit.text, "");
        assert_eq!(unit.meta.line_number, Some(3));
    }

    #[test]
    fn output_omits_absent_line_number() {
        let record = OutputRecord {
            page_id: "/a".into(),
            entities: vec![Entity::new("UK", "GPE", 4, 6)],
            line_number: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"page_id":"/a","entities":[{"name":"UK","type":"GPE","start":4,"end":6}]}"#
        );
    }
}
