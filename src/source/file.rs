//! File-backed row sources.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::record::Row;

fn open(path: &Path, gzip: bool) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|err| PipelineError::file_unavailable(path, err))?;
    if gzip {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Rows of a delimited file whose first line names the fields. Empty cells are null.
pub(super) fn delimited_rows(
    path: &Path,
    delimiter: u8,
    gzip: bool,
) -> Result<impl Iterator<Item = Result<Row>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(open(path, gzip)?);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| PipelineError::unavailable(path.display().to_string(), err))?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.is_empty() {
        return Err(PipelineError::unavailable(
            path.display().to_string(),
            "file has no header row",
        ));
    }

    Ok(reader
        .into_records()
        .enumerate()
        .map(move |(idx, record)| {
            let record = record.map_err(|err| PipelineError::Source {
                row: idx as u64 + 1,
                reason: err.to_string(),
            })?;
            Ok(headers
                .iter()
                .zip(record.iter())
                .map(|(name, cell)| {
                    let value = if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    };
                    (name.clone(), value)
                })
                .collect::<Row>())
        }))
}

/// Rows of a JSON-lines file; blank lines are ignored.
pub(super) fn json_lines(path: &Path, gzip: bool) -> Result<impl Iterator<Item = Result<Row>>> {
    let reader = BufReader::new(open(path, gzip)?);
    Ok(reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let row = idx as u64 + 1;
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(parse_object(&line, row)),
                Err(err) => Some(Err(PipelineError::Source {
                    row,
                    reason: err.to_string(),
                })),
            }
        }))
}

fn parse_object(line: &str, row: u64) -> Result<Row> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err(PipelineError::Source {
            row,
            reason: "line is not a JSON object".to_string(),
        }),
        Err(err) => Err(PipelineError::Source {
            row,
            reason: err.to_string(),
        }),
    }
}
