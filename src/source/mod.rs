//! Row sources: lazily pulled rows from delimited files, JSON lines or Postgres.

mod file;
mod postgres;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::record::Row;

pub use postgres::TableName;

/// Lazy row stream handed to the chunker.
pub type RowStream = Box<dyn Iterator<Item = Result<Row>>>;

/// Describes how to open a row source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Delimited text with a header row, optionally gzip-compressed.
    DelimitedFile {
        /// File path.
        path: PathBuf,
        /// Field separator byte.
        delimiter: u8,
        /// Whether the file is gzip-compressed.
        gzip: bool,
    },
    /// One JSON object per line, optionally gzip-compressed.
    JsonLines {
        /// File path.
        path: PathBuf,
        /// Whether the file is gzip-compressed.
        gzip: bool,
    },
    /// Every row of one Postgres table.
    Postgres {
        /// Connection string (`postgres://...`).
        url: String,
        /// Table to read.
        table: TableName,
    },
}

impl SourceDescriptor {
    /// Picks a descriptor from a location string.
    ///
    /// `postgres://` and `postgresql://` locations read `table`. File locations are read
    /// as JSON lines for `.jsonl`/`.ndjson`, comma-separated for `.csv` and tab-separated
    /// otherwise; a trailing `.gz` enables decompression. `delimiter` overrides the guess.
    pub fn from_location(location: &str, table: TableName, delimiter: Option<u8>) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(PipelineError::config("source location is empty"));
        }
        if location.starts_with("postgres://") || location.starts_with("postgresql://") {
            return Ok(SourceDescriptor::Postgres {
                url: location.to_string(),
                table,
            });
        }

        let path = PathBuf::from(location);
        let gzip = has_extension(&path, "gz");
        let inner = if gzip {
            path.file_stem().map(Path::new).unwrap_or(path.as_path())
        } else {
            path.as_path()
        };
        let extension = inner
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let descriptor = match extension.as_deref() {
            Some("jsonl") | Some("ndjson") => SourceDescriptor::JsonLines { path, gzip },
            Some("csv") => SourceDescriptor::DelimitedFile {
                path,
                delimiter: delimiter.unwrap_or(b','),
                gzip,
            },
            _ => SourceDescriptor::DelimitedFile {
                path,
                delimiter: delimiter.unwrap_or(b'\t'),
                gzip,
            },
        };
        Ok(descriptor)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::DelimitedFile { path, .. } | SourceDescriptor::JsonLines { path, .. } => {
                write!(f, "{}", path.display())
            }
            SourceDescriptor::Postgres { url, table } => {
                write!(f, "{} ({})", postgres::redact(url), table.qualified())
            }
        }
    }
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

/// Opens the source. Failing to open or reach it is [`PipelineError::SourceUnavailable`].
pub fn stream(descriptor: &SourceDescriptor) -> Result<RowStream> {
    let rows: RowStream = match descriptor {
        SourceDescriptor::DelimitedFile {
            path,
            delimiter,
            gzip,
        } => Box::new(file::delimited_rows(path, *delimiter, *gzip)?),
        SourceDescriptor::JsonLines { path, gzip } => Box::new(file::json_lines(path, *gzip)?),
        SourceDescriptor::Postgres { url, table } => Box::new(postgres::table_rows(url, table)?),
    };
    tracing::info!(source = %descriptor, "row source opened");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableName {
        TableName::new("content", "title").unwrap()
    }

    #[test]
    fn picks_descriptor_from_location() {
        assert_eq!(
            SourceDescriptor::from_location("data/title.tsv.gz", table(), None).unwrap(),
            SourceDescriptor::DelimitedFile {
                path: PathBuf::from("data/title.tsv.gz"),
                delimiter: b'\t',
                gzip: true,
            }
        );
        assert_eq!(
            SourceDescriptor::from_location("data/text.CSV", table(), None).unwrap(),
            SourceDescriptor::DelimitedFile {
                path: PathBuf::from("data/text.CSV"),
                delimiter: b',',
                gzip: false,
            }
        );
        assert_eq!(
            SourceDescriptor::from_location("rows.jsonl.gz", table(), None).unwrap(),
            SourceDescriptor::JsonLines {
                path: PathBuf::from("rows.jsonl.gz"),
                gzip: true,
            }
        );
        assert!(matches!(
            SourceDescriptor::from_location("postgres://u:p@db/govuk", table(), None).unwrap(),
            SourceDescriptor::Postgres { .. }
        ));
    }

    #[test]
    fn explicit_delimiter_wins() {
        let descriptor = SourceDescriptor::from_location("rows.txt", table(), Some(b'|')).unwrap();
        assert!(matches!(
            descriptor,
            SourceDescriptor::DelimitedFile { delimiter: b'|', .. }
        ));
    }

    #[test]
    fn display_redacts_passwords() {
        let descriptor =
            SourceDescriptor::from_location("postgres://reader:hunter2@db:5432/govuk", table(), None)
                .unwrap();
        let shown = descriptor.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("\"content\".\"title\""));
    }

    #[test]
    fn empty_location_is_a_configuration_error() {
        assert!(matches!(
            SourceDescriptor::from_location(" ", table(), None),
            Err(PipelineError::Configuration(_))
        ));
    }
}
