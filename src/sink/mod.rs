//! Newline-delimited JSON writer for local files and streamed object uploads.
//!
//! Lines use `", "` and `": "` separators and keep non-ASCII characters as-is, so the
//! artifacts are byte-compatible with what downstream consumers already read.

mod object;

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};

use crate::error::{PipelineError, Result};
use crate::record::OutputRecord;

pub use object::ObjectStore;
use object::ObjectUpload;

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Where a chunk's output goes.
#[derive(Debug, Clone)]
pub enum Destination {
    /// File on the local filesystem.
    Local(PathBuf),
    /// Object in a bucket, written with a single streamed `PUT`.
    Object {
        /// Store holding the bucket.
        store: ObjectStore,
        /// Object name within the bucket.
        name: String,
    },
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(path) => write!(f, "{}", path.display()),
            Destination::Object { store, name } => write!(f, "{}", store.describe(name)),
        }
    }
}

enum Output {
    /// Lines go to `staging` and are renamed onto `path` once the sink finishes.
    Local {
        writer: BufWriter<File>,
        staging: PathBuf,
        path: PathBuf,
    },
    Object(BufWriter<ObjectUpload>),
}

impl Output {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Output::Local { writer, .. } => writer,
            Output::Object(writer) => writer,
        }
    }

    /// Flushes, closes and publishes the output under its final name.
    fn commit(self) -> io::Result<()> {
        match self {
            Output::Local {
                mut writer,
                staging,
                path,
            } => {
                let synced = writer.flush().and_then(|()| writer.get_ref().sync_all());
                drop(writer);
                let published = synced.and_then(|()| fs::rename(&staging, &path));
                if published.is_err() {
                    let _ = fs::remove_file(&staging);
                }
                published
            }
            Output::Object(writer) => {
                let upload = writer.into_inner().map_err(|err| err.into_error())?;
                upload.finish()
            }
        }
    }

    /// Closes the output without publishing anything.
    fn abort(self) -> io::Result<()> {
        match self {
            Output::Local {
                writer, staging, ..
            } => {
                let (file, _) = writer.into_parts();
                drop(file);
                fs::remove_file(&staging)
            }
            Output::Object(writer) => {
                let (upload, _) = writer.into_parts();
                upload.abort()
            }
        }
    }
}

fn staging_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(format!(".{name}.partial")))
}

/// Open JSONL destination.
///
/// Output only becomes visible under the destination name through [`JsonlSink::finish`].
/// A sink dropped before that is closed and its partial output discarded: a local staging
/// file is removed and an object upload is cancelled before the store commits it.
pub struct JsonlSink {
    output: Option<Output>,
    destination: String,
    line: Vec<u8>,
    written: u64,
}

impl JsonlSink {
    /// Opens the destination. An existing local file is replaced once the sink finishes.
    pub fn create(destination: &Destination) -> Result<Self> {
        let name = destination.to_string();
        let output = match destination {
            Destination::Local(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|err| PipelineError::sink(&name, err))?;
                }
                let staging = staging_path(path).ok_or_else(|| {
                    PipelineError::sink(&name, "destination has no usable file name")
                })?;
                let file = File::create(&staging).map_err(|err| PipelineError::sink(&name, err))?;
                Output::Local {
                    writer: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
                    staging,
                    path: path.clone(),
                }
            }
            Destination::Object { store, name: object } => {
                let upload = store.open_upload(object)?;
                Output::Object(BufWriter::with_capacity(WRITE_BUFFER_BYTES, upload))
            }
        };
        tracing::debug!(destination = %name, "opened sink");
        Ok(Self {
            output: Some(output),
            destination: name,
            line: Vec::with_capacity(1024),
            written: 0,
        })
    }

    /// Serializes one record as a line.
    pub fn write_record(&mut self, record: &OutputRecord) -> Result<()> {
        self.line.clear();
        encode_line(record, &mut self.line).map_err(|err| PipelineError::sink(&self.destination, err))?;
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| PipelineError::sink(&self.destination, "sink already closed"))?;
        output
            .writer()
            .write_all(&self.line)
            .map_err(|err| PipelineError::sink(&self.destination, err))?;
        self.written += 1;
        Ok(())
    }

    /// Flushes, closes and publishes the destination, returning the number of lines written.
    pub fn finish(mut self) -> Result<u64> {
        if let Some(output) = self.output.take() {
            output
                .commit()
                .map_err(|err| PipelineError::sink(&self.destination, err))?;
        }
        tracing::debug!(destination = %self.destination, lines = self.written, "closed sink");
        Ok(self.written)
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Some(output) = self.output.take() {
            tracing::warn!(
                destination = %self.destination,
                lines = self.written,
                "discarding unfinished output"
            );
            if let Err(err) = output.abort() {
                tracing::warn!(destination = %self.destination, error = %err, "failed to discard output");
            }
        }
    }
}

/// Writes every record to `destination`, returning the number of lines written.
///
/// The first upstream error stops the write and nothing is published.
pub fn write_records<I>(destination: &Destination, records: I) -> Result<u64>
where
    I: IntoIterator<Item = Result<OutputRecord>>,
{
    let mut sink = JsonlSink::create(destination)?;
    for record in records {
        sink.write_record(&record?)?;
    }
    sink.finish()
}

/// Appends `record` as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(record: &T, out: &mut Vec<u8>) -> serde_json::Result<()> {
    let mut serializer = Serializer::with_formatter(&mut *out, SpacedFormatter);
    record.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(())
}

/// Compact JSON with a space after every `,` and `:`.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + Write,
    {
        writer.write_all(b": ")
    }
}
