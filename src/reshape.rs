//! Turns loosely typed rows into typed records and model-ready units.

use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::record::{PagePart, Record, Row, Unit};

/// Names of the row fields the reshaper reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNames {
    /// Correlation key field.
    pub id: String,
    /// Body text field used in text mode.
    pub line: String,
    /// Line position field used in text mode.
    pub line_number: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            id: "page_id".to_string(),
            line: "line".to_string(),
            line_number: "line_number".to_string(),
        }
    }
}

impl FieldNames {
    /// Field holding the text for the given part.
    pub fn text_field(&self, part: PagePart) -> &str {
        match part {
            PagePart::Title => "title",
            PagePart::Description => "description",
            PagePart::Text => &self.line,
        }
    }
}

/// What to do with a row that has no correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MissingIdPolicy {
    /// Drop the row.
    #[default]
    Skip,
    /// Keep the row under a placeholder key.
    Substitute(String),
}

/// Settings shared by every reshape call in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapeOptions {
    /// Part of page being processed.
    pub part: PagePart,
    /// Field names to read.
    pub fields: FieldNames,
    /// Missing-id handling.
    pub missing_id: MissingIdPolicy,
}

impl ReshapeOptions {
    /// Default field names and skip-on-missing-id for `part`.
    pub fn new(part: PagePart) -> Self {
        Self {
            part,
            fields: FieldNames::default(),
            missing_id: MissingIdPolicy::Skip,
        }
    }
}

/// Converts a row into a typed record.
///
/// Returns `Ok(None)` when the row has no id and the policy is [`MissingIdPolicy::Skip`].
pub fn record_from_row(mut row: Row, options: &ReshapeOptions) -> Result<Option<Record>> {
    let page_id = match take_page_id(&mut row, &options.fields.id)? {
        Some(id) => id,
        None => match &options.missing_id {
            MissingIdPolicy::Skip => return Ok(None),
            MissingIdPolicy::Substitute(placeholder) => placeholder.clone(),
        },
    };

    let text_field = options.fields.text_field(options.part);
    let text = take_text(&mut row, text_field, &page_id)?;
    let record = match options.part {
        PagePart::Title => Record::Title {
            page_id,
            title: text,
        },
        PagePart::Description => Record::Description {
            page_id,
            description: text,
        },
        PagePart::Text => {
            let line_number = take_line_number(&mut row, &options.fields.line_number, &page_id)?;
            Record::Text {
                page_id,
                line_number,
                line: text,
            }
        }
    };
    Ok(Some(record))
}

fn take_page_id(row: &mut Row, field: &str) -> Result<Option<String>> {
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(PipelineError::malformed(
            "",
            format!("field `{field}` holds {} instead of a page id", kind_of(&other)),
        )),
    }
}

fn take_text(row: &mut Row, field: &str, page_id: &str) -> Result<Option<String>> {
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(other) => Err(PipelineError::malformed(
            page_id,
            format!("text field `{field}` holds {} instead of a string", kind_of(&other)),
        )),
    }
}

fn take_line_number(row: &mut Row, field: &str, page_id: &str) -> Result<Option<i64>> {
    let invalid = |found: &str| {
        PipelineError::malformed(
            page_id,
            format!("line number field `{field}` holds {found} instead of an integer"),
        )
    };
    match row.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| invalid(&n.to_string())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(&format!("`{s}`"))),
        Some(other) => Err(invalid(kind_of(&other))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Lazily reshapes a row stream into units, preserving order.
pub fn reshape<I>(rows: I, options: &ReshapeOptions) -> Reshape<'_, I>
where
    I: Iterator<Item = Result<Row>>,
{
    Reshape {
        rows,
        options,
        skipped: 0,
    }
}

/// Iterator returned by [`reshape`].
pub struct Reshape<'a, I> {
    rows: I,
    options: &'a ReshapeOptions,
    skipped: u64,
}

impl<I> Reshape<'_, I> {
    /// Number of rows dropped so far for lacking an id.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<I> Iterator for Reshape<'_, I>
where
    I: Iterator<Item = Result<Row>>,
{
    type Item = Result<Unit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.rows.next()? {
                Ok(row) => row,
                Err(err) => return Some(Err(err)),
            };
            match record_from_row(row, self.options) {
                Ok(Some(record)) => return Some(Ok(record.into_unit())),
                Ok(None) => {
                    self.skipped += 1;
                    tracing::debug!(
                        part = %self.options.part,
                        skipped = self.skipped,
                        "skipping row without page id"
                    );
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
