//! Command-line, environment and settings-file configuration for extraction runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use url::Url;

use crate::driver::{ChunkSelection, OutputTarget, RunConfig};
use crate::engine::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::model::{ModelLocation, ModelSettings};
use crate::record::PagePart;
use crate::reshape::{FieldNames, MissingIdPolicy, ReshapeOptions};
use crate::sink::ObjectStore;
use crate::source::{SourceDescriptor, TableName};

const DEFAULT_SCHEMA: &str = "content";
const DEFAULT_OUTPUT_PREFIX: &str = "content_ner/";
const DEFAULT_OUTPUT_DIR: &str = "content_ner";
const DEFAULT_PLACEHOLDER: &str = "unknown";
const OBJECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How rows without a page id are handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingIdArg {
    /// Drop the row.
    Skip,
    /// Keep the row under a placeholder id.
    Substitute,
}

/// Command-line interface of `govner-extract`.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "govner-extract",
    about = "Extract named entities from GOV.UK page titles, descriptions or body text"
)]
pub struct Cli {
    /// Part of page to extract entities from
    #[arg(short = 'p', long, env = "GOVNER_PART_OF_PAGE", value_enum)]
    pub part_of_page: PagePart,

    /// NER model: service URL (http/https) or entity pattern file
    #[arg(short = 'm', long, env = "GOVNER_NER_MODEL")]
    pub ner_model: String,

    /// Texts per model call
    #[arg(short = 'b', long, env = "GOVNER_BATCH_SIZE", default_value_t = 30)]
    pub batch_size: usize,

    /// Parallel model workers
    #[arg(short = 'n', long, env = "GOVNER_N_PROC", default_value_t = 1)]
    pub n_proc: usize,

    /// Rows per output chunk
    #[arg(short = 'c', long, env = "GOVNER_CHUNK_SIZE", default_value_t = 40_000)]
    pub chunk_size: usize,

    /// Run date used in output names (default: today as DDMMYY)
    #[arg(short = 'd', long, env = "GOVNER_DATE")]
    pub date: Option<String>,

    /// Row source: delimited/JSONL file (optionally .gz) or postgres:// URL
    #[arg(long, env = "GOVNER_SOURCE")]
    pub source: Option<String>,

    /// Source table (default: the part of page)
    #[arg(long, env = "GOVNER_SOURCE_TABLE")]
    pub source_table: Option<String>,

    /// Source schema (default: content)
    #[arg(long, env = "GOVNER_SOURCE_SCHEMA")]
    pub source_schema: Option<String>,

    /// Field delimiter for delimited files
    #[arg(long, env = "GOVNER_DELIMITER")]
    pub delimiter: Option<char>,

    /// Local directory for output chunks (default: content_ner)
    #[arg(long, env = "GOVNER_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Bucket for output chunks; enables object storage output
    #[arg(long, env = "GOVNER_BUCKET")]
    pub bucket: Option<String>,

    /// Object store endpoint URL
    #[arg(long, env = "GOVNER_OBJECT_ENDPOINT")]
    pub object_endpoint: Option<String>,

    /// Bearer token for the object store
    #[arg(long, env = "GOVNER_OBJECT_TOKEN", hide_env_values = true)]
    pub object_token: Option<String>,

    /// Object name prefix (default: content_ner/)
    #[arg(long, env = "GOVNER_OUTPUT_PREFIX")]
    pub output_prefix: Option<String>,

    /// Row field holding the page id (default: page_id)
    #[arg(long, env = "GOVNER_ID_FIELD")]
    pub id_field: Option<String>,

    /// What to do with rows lacking a page id (default: skip)
    #[arg(long, env = "GOVNER_MISSING_ID", value_enum)]
    pub missing_id: Option<MissingIdArg>,

    /// Placeholder page id used with `--missing-id substitute` (default: unknown)
    #[arg(long, env = "GOVNER_MISSING_ID_PLACEHOLDER")]
    pub missing_id_placeholder: Option<String>,

    /// Skip chunks before this index
    #[arg(long, env = "GOVNER_FROM_CHUNK", default_value_t = 0)]
    pub from_chunk: usize,

    /// Process only these chunk indices (repeatable, comma separated)
    #[arg(long, value_delimiter = ',')]
    pub only_chunk: Vec<usize>,

    /// Seconds before a model service request times out
    #[arg(long, env = "GOVNER_MODEL_TIMEOUT_SECS", default_value_t = 60)]
    pub model_timeout_secs: u64,

    /// Attempts per batch against a model service
    #[arg(long, env = "GOVNER_MODEL_MAX_RETRIES", default_value_t = 5)]
    pub model_max_retries: usize,

    /// YAML settings file with environment-specific names
    #[arg(long, env = "GOVNER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Settings file contents; every key is optional and command-line values win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    /// Row source location.
    pub source: Option<String>,
    /// Source schema.
    pub source_schema: Option<String>,
    /// Source table.
    pub source_table: Option<String>,
    /// Field delimiter.
    pub delimiter: Option<char>,
    /// Local output directory.
    pub output_dir: Option<PathBuf>,
    /// Output bucket.
    pub bucket: Option<String>,
    /// Object store endpoint.
    pub object_endpoint: Option<String>,
    /// Object store token.
    pub object_token: Option<String>,
    /// Object name prefix.
    pub output_prefix: Option<String>,
    /// Page id field.
    pub id_field: Option<String>,
    /// Missing id policy.
    pub missing_id: Option<MissingIdArg>,
    /// Missing id placeholder.
    pub missing_id_placeholder: Option<String>,
}

impl FileSettings {
    /// Reads a YAML settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            PipelineError::config(format!("failed to read settings {}: {err}", path.display()))
        })?;
        serde_yaml::from_str(&raw).map_err(|err| {
            PipelineError::config(format!("invalid settings {}: {err}", path.display()))
        })
    }
}

/// Validated configuration of one extraction run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Row source.
    pub source: SourceDescriptor,
    /// Model to load.
    pub model: ModelSettings,
    /// Engine throughput settings.
    pub engine: EngineConfig,
    /// Chunking, naming and output settings.
    pub run: RunConfig,
}

impl Cli {
    /// Merges the settings file (if any) and validates everything into a [`PipelineConfig`].
    pub fn build_config(&self) -> Result<PipelineConfig> {
        let file = match &self.config {
            Some(path) => FileSettings::load(path)?,
            None => FileSettings::default(),
        };
        self.merge(file)
    }

    fn merge(&self, file: FileSettings) -> Result<PipelineConfig> {
        let part = self.part_of_page;
        if self.chunk_size == 0 {
            return Err(PipelineError::config("chunk size must be at least 1"));
        }
        let engine = EngineConfig::new(self.batch_size, self.n_proc)?;

        let mut model = ModelSettings::new(ModelLocation::parse(&self.ner_model)?);
        model.timeout = Duration::from_secs(self.model_timeout_secs.max(1));
        model.max_retries = self.model_max_retries.max(1);

        let source = self
            .source
            .clone()
            .or(file.source)
            .ok_or_else(|| PipelineError::config("no row source given (--source or `source:` in settings)"))?;
        let table = TableName::new(
            self.source_schema
                .clone()
                .or(file.source_schema)
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            self.source_table
                .clone()
                .or(file.source_table)
                .unwrap_or_else(|| part.as_str().to_string()),
        )?;
        let delimiter = self
            .delimiter
            .or(file.delimiter)
            .map(delimiter_byte)
            .transpose()?;
        let source = SourceDescriptor::from_location(&source, table, delimiter)?;

        let mut fields = FieldNames::default();
        if let Some(id) = self.id_field.clone().or(file.id_field) {
            if id.trim().is_empty() {
                return Err(PipelineError::config("id field name is empty"));
            }
            fields.id = id;
        }
        let missing_id = match self.missing_id.or(file.missing_id).unwrap_or(MissingIdArg::Skip) {
            MissingIdArg::Skip => MissingIdPolicy::Skip,
            MissingIdArg::Substitute => MissingIdPolicy::Substitute(
                self.missing_id_placeholder
                    .clone()
                    .or(file.missing_id_placeholder)
                    .unwrap_or_else(|| DEFAULT_PLACEHOLDER.to_string()),
            ),
        };
        let reshape = ReshapeOptions {
            part,
            fields,
            missing_id,
        };

        let output_dir = self.output_dir.clone().or(file.output_dir);
        let output = match self.bucket.clone().or(file.bucket) {
            Some(bucket) => {
                if output_dir.is_some() {
                    return Err(PipelineError::config(
                        "choose either an output directory or a bucket, not both",
                    ));
                }
                let endpoint = self
                    .object_endpoint
                    .clone()
                    .or(file.object_endpoint)
                    .ok_or_else(|| PipelineError::config("a bucket needs --object-endpoint"))?;
                let endpoint = Url::parse(&endpoint).map_err(|err| {
                    PipelineError::config(format!("invalid object endpoint `{endpoint}`: {err}"))
                })?;
                let token = self.object_token.clone().or(file.object_token);
                OutputTarget::Object {
                    store: ObjectStore::new(endpoint, bucket, token, OBJECT_CONNECT_TIMEOUT)?,
                    prefix: self
                        .output_prefix
                        .clone()
                        .or(file.output_prefix)
                        .unwrap_or_else(|| DEFAULT_OUTPUT_PREFIX.to_string()),
                }
            }
            None => OutputTarget::LocalDir(
                output_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            ),
        };

        let date = match &self.date {
            Some(date) => validate_date(date)?,
            None => chrono::Local::now().format("%d%m%y").to_string(),
        };

        Ok(PipelineConfig {
            source,
            model,
            engine,
            run: RunConfig {
                part,
                date,
                chunk_size: self.chunk_size,
                reshape,
                output,
                selection: ChunkSelection::new(self.from_chunk, self.only_chunk.iter().copied()),
            },
        })
    }
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    u8::try_from(delimiter)
        .ok()
        .filter(|byte| byte.is_ascii() && *byte != b'\n' && *byte != b'"')
        .ok_or_else(|| {
            PipelineError::config(format!("delimiter `{delimiter}` must be a single ASCII character"))
        })
}

fn validate_date(date: &str) -> Result<String> {
    let date = date.trim();
    if date.is_empty() || date.contains(['/', '\\']) || date.chars().any(char::is_whitespace) {
        return Err(PipelineError::config(format!(
            "date `{date}` cannot be used in an output name"
        )));
    }
    Ok(date.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["govner-extract"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn defaults_mirror_the_bulk_pipeline() {
        let cli = parse(&["-p", "title", "-m", "patterns.jsonl", "--source", "title.tsv.gz", "-d", "200722"]);
        let config = cli.build_config().unwrap();
        assert_eq!(config.engine.batch_size(), 30);
        assert_eq!(config.engine.worker_count(), 1);
        assert_eq!(config.run.chunk_size, 40_000);
        assert_eq!(config.run.date, "200722");
        assert_eq!(config.run.reshape.missing_id, MissingIdPolicy::Skip);
        assert!(matches!(
            config.run.output,
            OutputTarget::LocalDir(ref dir) if dir == Path::new("content_ner")
        ));
        assert!(matches!(
            config.source,
            SourceDescriptor::DelimitedFile { gzip: true, delimiter: b'\t', .. }
        ));
    }

    #[test]
    fn default_date_is_ddmmyy() {
        let cli = parse(&["-p", "text", "-m", "p.jsonl", "--source", "t.tsv"]);
        let date = cli.build_config().unwrap().run.date;
        assert_eq!(date.len(), 6);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn settings_file_fills_gaps_and_flags_win() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "source: postgres://reader@db/govuk\nsource_schema: content\nbucket: govuk-ner\nobject_endpoint: http://localhost:9000\noutput_prefix: ner/\nid_field: url\nmissing_id: substitute"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = parse(&[
            "-p", "description", "-m", "http://localhost:8080/ner", "--config", path.as_str(),
            "--output-prefix", "override/", "--only-chunk", "3,5",
        ]);
        let config = cli.build_config().unwrap();
        match &config.source {
            SourceDescriptor::Postgres { table, .. } => {
                assert_eq!(table.qualified(), "\"content\".\"description\"")
            }
            other => panic!("expected postgres source, got {other:?}"),
        }
        match &config.run.output {
            OutputTarget::Object { store, prefix } => {
                assert_eq!(prefix, "override/");
                assert_eq!(store.bucket(), "govuk-ner");
            }
            other => panic!("expected object output, got {other:?}"),
        }
        assert_eq!(config.run.reshape.fields.id, "url");
        assert_eq!(
            config.run.reshape.missing_id,
            MissingIdPolicy::Substitute("unknown".into())
        );
        assert!(config.run.selection.includes(5));
        assert!(!config.run.selection.includes(4));
        assert!(matches!(config.model.location, ModelLocation::Service(_)));
    }

    #[test]
    fn rejects_invalid_settings() {
        let bad = [
            vec!["-p", "title", "-m", "p.jsonl", "--source", "t.tsv", "-b", "0"],
            vec!["-p", "title", "-m", "p.jsonl", "--source", "t.tsv", "-c", "0"],
            vec!["-p", "title", "-m", "p.jsonl"],
            vec!["-p", "title", "-m", "p.jsonl", "--source", "t.tsv", "--bucket", "b"],
            vec!["-p", "title", "-m", "p.jsonl", "--source", "t.tsv", "-d", "20/07/22"],
            vec!["-p", "title", "-m", "p.jsonl", "--source", "t.tsv", "--delimiter", "é"],
        ];
        for args in bad {
            let err = parse(&args).build_config().unwrap_err();
            assert!(
                matches!(err, PipelineError::Configuration(_)),
                "{args:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn unknown_part_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["govner-extract", "-p", "body", "-m", "x"]).is_err());
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sorce: typo.tsv").unwrap();
        assert!(matches!(
            FileSettings::load(file.path()),
            Err(PipelineError::Configuration(_))
        ));
    }
}
