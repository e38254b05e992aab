use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::schema::SourceColumn;

/// A validation failure, reported by kind. Validation collects every failure
/// it finds rather than stopping at the first.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("config root must be a JSON object")]
    RootNotObject,
    #[error("missing required config block '{0}'")]
    MissingBlock(&'static str),
    #[error("config block '{slot}' must be a JSON object")]
    BlockNotObject { slot: &'static str },
    #[error("config block '{slot}' has config_type '{found}'")]
    ConfigTypeMismatch { slot: &'static str, found: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("column '{column}' does not exist on the source table")]
    UnknownColumn { column: String },
    #[error("column '{column}' must have a textual type, found '{data_type}'")]
    NotTextual { column: String, data_type: String },
    #[error("column '{column}' is bytea, which parsing 'none' cannot handle")]
    ByteaWithoutParser { column: String },
    #[error("parsing 'pymupdf' requires a bytea loading column, found '{data_type}'")]
    PdfNeedsBytea { data_type: String },
    #[error("document loading is incompatible with parsing 'none'")]
    DocumentWithoutParser,
    #[error("batch table '{table}' already exists")]
    BatchTableExists { table: String },
    #[error("voyageai input_type must be 'query' or 'document', found '{0}'")]
    BadInputType(String),
    #[error("automatic indexing requires a scheduler")]
    IndexingWithoutScheduler,
}

// ── Config blocks ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum EmbeddingConfig {
    #[serde(rename = "openai")]
    OpenAi {
        model: String,
        dimensions: u32,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        api_key_name: Option<String>,
        #[serde(default)]
        use_batch_api: bool,
    },
    #[serde(rename = "ollama")]
    Ollama {
        model: String,
        dimensions: u32,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        keep_alive: Option<String>,
    },
    #[serde(rename = "voyageai")]
    VoyageAi {
        model: String,
        dimensions: u32,
        #[serde(default)]
        api_key_name: Option<String>,
        #[serde(default)]
        input_type: Option<String>,
    },
}

impl EmbeddingConfig {
    pub fn model(&self) -> &str {
        match self {
            Self::OpenAi { model, .. } | Self::Ollama { model, .. } | Self::VoyageAi { model, .. } => {
                model
            }
        }
    }

    pub fn dimensions(&self) -> u32 {
        match self {
            Self::OpenAi { dimensions, .. }
            | Self::Ollama { dimensions, .. }
            | Self::VoyageAi { dimensions, .. } => *dimensions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum ChunkingConfig {
    #[serde(rename = "character_text_splitter")]
    Character {
        chunk_column: String,
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
        #[serde(default = "default_chunk_overlap")]
        chunk_overlap: usize,
        #[serde(default = "default_separator")]
        separator: String,
    },
    #[serde(rename = "recursive_character_text_splitter")]
    Recursive {
        chunk_column: String,
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
        #[serde(default = "default_chunk_overlap")]
        chunk_overlap: usize,
        #[serde(default = "default_separators")]
        separators: Vec<String>,
    },
}

fn default_chunk_size() -> usize {
    800
}

fn default_chunk_overlap() -> usize {
    400
}

fn default_separator() -> String {
    "\n\n".to_string()
}

fn default_separators() -> Vec<String> {
    vec!["\n\n".to_string(), "\n".to_string(), " ".to_string(), "".to_string()]
}

impl ChunkingConfig {
    pub fn chunk_column(&self) -> &str {
        match self {
            Self::Character { chunk_column, .. } | Self::Recursive { chunk_column, .. } => {
                chunk_column
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum LoadingConfig {
    /// Chunk the configured source column directly.
    #[default]
    #[serde(rename = "row")]
    Row,
    /// The column holds a file path or URL; load and parse the document.
    #[serde(rename = "document")]
    Document { column_name: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum ParsingConfig {
    /// Sniff the payload: PDF magic bytes go to the PDF parser, the rest is text.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// Pass text payloads through untouched. Rejects binary columns.
    #[serde(rename = "none")]
    None,
    /// PDF text extraction.
    #[serde(rename = "pymupdf")]
    PyMuPdf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum FormattingConfig {
    /// `$var` substitution over source-row values; `$chunk` is the chunk text.
    #[serde(rename = "template")]
    Template {
        #[serde(default = "default_template")]
        template: String,
    },
}

fn default_template() -> String {
    "$chunk".to_string()
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self::Template {
            template: default_template(),
        }
    }
}

impl FormattingConfig {
    pub fn template(&self) -> &str {
        match self {
            Self::Template { template } => template,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum DestinationConfig {
    /// Derive target and view names from the source table.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Caller-supplied target and view names.
    #[serde(rename = "custom")]
    Custom {
        #[serde(default)]
        target_schema: Option<String>,
        target_table: String,
        #[serde(default)]
        view_schema: Option<String>,
        #[serde(default)]
        view_name: Option<String>,
    },
    /// Store the embedding in a vector column on the source table itself.
    #[serde(rename = "source")]
    Source { embedding_column: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum SchedulingConfig {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "timescaledb")]
    TimescaleDb {
        #[serde(default = "default_schedule_interval")]
        schedule_interval: String,
        #[serde(default)]
        initial_start: Option<String>,
        #[serde(default)]
        timezone: Option<String>,
        /// Filled in by create_vectorizer once the job is registered.
        #[serde(default)]
        job_id: Option<i64>,
    },
}

fn default_schedule_interval() -> String {
    "5m".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum IndexingConfig {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "diskann")]
    DiskAnn {
        #[serde(default = "default_min_rows")]
        min_rows: i64,
    },
    #[serde(rename = "hnsw")]
    Hnsw {
        #[serde(default = "default_min_rows")]
        min_rows: i64,
        #[serde(default)]
        m: Option<i32>,
        #[serde(default)]
        ef_construction: Option<i32>,
    },
}

fn default_min_rows() -> i64 {
    100_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum GrantToConfig {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "explicit")]
    Explicit { roles: Vec<String> },
    #[serde(rename = "timescale")]
    Timescale,
}

impl GrantToConfig {
    /// Roles that receive access to the source, queue, and target.
    pub fn roles(&self) -> Vec<String> {
        match self {
            Self::Default => Vec::new(),
            Self::Explicit { roles } => roles.clone(),
            Self::Timescale => vec!["tsdbadmin".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "implementation", deny_unknown_fields)]
pub enum ProcessingConfig {
    #[serde(rename = "default")]
    Default {
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
}

fn default_batch_size() -> usize {
    50
}

fn default_concurrency() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    6
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self::Default {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl ProcessingConfig {
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Default { batch_size, .. } => *batch_size,
        }
    }

    pub fn concurrency(&self) -> usize {
        match self {
            Self::Default { concurrency, .. } => (*concurrency).max(1),
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        match self {
            Self::Default { timeout_secs, .. } => std::time::Duration::from_secs(*timeout_secs),
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Default { max_retries, .. } => *max_retries,
        }
    }
}

/// The full configuration document stored with a vectorizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VectorizerConfig {
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub loading: LoadingConfig,
    #[serde(default)]
    pub parsing: ParsingConfig,
    #[serde(default)]
    pub formatting: FormattingConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub grant_to: GrantToConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Slots a config document may carry, with whether they are required.
const SLOTS: &[(&str, bool)] = &[
    ("embedding", true),
    ("chunking", true),
    ("loading", false),
    ("parsing", false),
    ("formatting", false),
    ("destination", false),
    ("scheduling", false),
    ("indexing", false),
    ("grant_to", false),
    ("processing", false),
];

impl VectorizerConfig {
    /// Parse a raw config document. Each sub-block may carry a `config_type`
    /// discriminator, which must match its slot; it is stripped before the
    /// typed parse so unknown-field rejection stays strict.
    pub fn from_value(mut value: serde_json::Value) -> Result<Self, Vec<ConfigError>> {
        let mut errors = Vec::new();
        let obj = match value.as_object_mut() {
            Some(obj) => obj,
            None => return Err(vec![ConfigError::RootNotObject]),
        };

        for &(slot, required) in SLOTS {
            match obj.get_mut(slot) {
                Some(block) => match block.as_object_mut() {
                    Some(map) => {
                        if let Some(ct) = map.remove("config_type") {
                            let found = ct.as_str().unwrap_or_default().to_string();
                            if found != slot {
                                errors.push(ConfigError::ConfigTypeMismatch { slot, found });
                            }
                        }
                    }
                    None => errors.push(ConfigError::BlockNotObject { slot }),
                },
                None if required => errors.push(ConfigError::MissingBlock(slot)),
                None => {}
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let parsed: Self = serde_json::from_value(value.clone())
            .map_err(|e| vec![ConfigError::Invalid(e.to_string())])?;

        // Tagged-enum parsing tolerates extra fields, so unknown keys are
        // checked against the canonical serialization of each block.
        let canonical = serde_json::to_value(&parsed)
            .map_err(|e| vec![ConfigError::Invalid(e.to_string())])?;
        for &(slot, _) in SLOTS {
            let (Some(input_block), Some(canonical_block)) = (
                value.get(slot).and_then(|v| v.as_object()),
                canonical.get(slot).and_then(|v| v.as_object()),
            ) else {
                continue;
            };
            for key in input_block.keys() {
                if !canonical_block.contains_key(key) {
                    errors.push(ConfigError::Invalid(format!(
                        "unknown field `{}` in config block '{}'",
                        key, slot
                    )));
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(parsed)
    }

    /// The source column the pipeline reads its payload from.
    pub fn payload_column(&self) -> &str {
        match &self.loading {
            LoadingConfig::Row => self.chunking.chunk_column(),
            LoadingConfig::Document { column_name } => column_name,
        }
    }

    /// Cross-field validation against the source table's columns.
    /// `batch_table_exists` reports whether either derived batch table is
    /// already present (checked by the provisioner for openai batch mode).
    pub fn validate(
        &self,
        source_columns: &[SourceColumn],
        batch_table_exists: Option<&str>,
    ) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let payload = self.payload_column();
        match source_columns.iter().find(|c| c.name == payload) {
            None => errors.push(ConfigError::UnknownColumn {
                column: payload.to_string(),
            }),
            Some(col) if !col.is_textual() => errors.push(ConfigError::NotTextual {
                column: col.name.clone(),
                data_type: col.data_type.clone(),
            }),
            Some(col) => {
                if col.is_bytea() && self.parsing == ParsingConfig::None {
                    errors.push(ConfigError::ByteaWithoutParser {
                        column: col.name.clone(),
                    });
                }
                if self.parsing == ParsingConfig::PyMuPdf && !col.is_bytea() {
                    errors.push(ConfigError::PdfNeedsBytea {
                        data_type: col.data_type.clone(),
                    });
                }
            }
        }

        if matches!(self.loading, LoadingConfig::Document { .. })
            && self.parsing == ParsingConfig::None
        {
            errors.push(ConfigError::DocumentWithoutParser);
        }

        if let EmbeddingConfig::OpenAi { use_batch_api: true, .. } = &self.embedding {
            if let Some(table) = batch_table_exists {
                errors.push(ConfigError::BatchTableExists {
                    table: table.to_string(),
                });
            }
        }

        if let EmbeddingConfig::VoyageAi {
            input_type: Some(input_type),
            ..
        } = &self.embedding
        {
            if input_type != "query" && input_type != "document" {
                errors.push(ConfigError::BadInputType(input_type.clone()));
            }
        }

        if self.scheduling == SchedulingConfig::None && self.indexing != IndexingConfig::None {
            errors.push(ConfigError::IndexingWithoutScheduler);
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<SourceColumn> {
        vec![
            SourceColumn {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                is_nullable: false,
                ordinal_position: 1,
            },
            SourceColumn {
                name: "body".to_string(),
                data_type: "text".to_string(),
                is_nullable: true,
                ordinal_position: 2,
            },
            SourceColumn {
                name: "doc".to_string(),
                data_type: "bytea".to_string(),
                is_nullable: true,
                ordinal_position: 3,
            },
        ]
    }

    fn minimal() -> serde_json::Value {
        json!({
            "embedding": {
                "config_type": "embedding",
                "implementation": "openai",
                "model": "text-embedding-3-small",
                "dimensions": 1536
            },
            "chunking": {
                "config_type": "chunking",
                "implementation": "character_text_splitter",
                "chunk_column": "body"
            }
        })
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = VectorizerConfig::from_value(minimal()).unwrap();
        assert_eq!(config.loading, LoadingConfig::Row);
        assert_eq!(config.parsing, ParsingConfig::Auto);
        assert_eq!(config.processing.batch_size(), 50);
        assert_eq!(config.processing.concurrency(), 1);
        assert_eq!(config.formatting.template(), "$chunk");
        assert_eq!(config.payload_column(), "body");
        assert!(config.validate(&columns(), None).is_empty());
    }

    #[test]
    fn test_root_must_be_object() {
        let err = VectorizerConfig::from_value(json!([1, 2])).unwrap_err();
        assert_eq!(err, vec![ConfigError::RootNotObject]);
    }

    #[test]
    fn test_missing_required_blocks_are_collected() {
        let err = VectorizerConfig::from_value(json!({})).unwrap_err();
        assert!(err.contains(&ConfigError::MissingBlock("embedding")));
        assert!(err.contains(&ConfigError::MissingBlock("chunking")));
    }

    #[test]
    fn test_config_type_mismatch() {
        let mut doc = minimal();
        doc["chunking"]["config_type"] = json!("embedding");
        let err = VectorizerConfig::from_value(doc).unwrap_err();
        assert!(matches!(
            err[0],
            ConfigError::ConfigTypeMismatch { slot: "chunking", .. }
        ));
    }

    #[test]
    fn test_unknown_implementation_rejected() {
        let mut doc = minimal();
        doc["embedding"]["implementation"] = json!("bedrock");
        let err = VectorizerConfig::from_value(doc).unwrap_err();
        assert!(matches!(err[0], ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut doc = minimal();
        doc["chunking"]["chunk_sizes"] = json!(100);
        let err = VectorizerConfig::from_value(doc).unwrap_err();
        assert!(matches!(err[0], ConfigError::Invalid(_)));
    }

    #[test]
    fn test_chunk_column_must_exist() {
        let mut doc = minimal();
        doc["chunking"]["chunk_column"] = json!("missing");
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert_eq!(
            errors,
            vec![ConfigError::UnknownColumn {
                column: "missing".to_string()
            }]
        );
    }

    #[test]
    fn test_chunk_column_must_be_textual() {
        let mut doc = minimal();
        doc["chunking"]["chunk_column"] = json!("id");
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert!(matches!(errors[0], ConfigError::NotTextual { .. }));
    }

    #[test]
    fn test_bytea_forbidden_without_parser() {
        let mut doc = minimal();
        doc["chunking"]["chunk_column"] = json!("doc");
        doc["parsing"] = json!({"implementation": "none"});
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert!(matches!(errors[0], ConfigError::ByteaWithoutParser { .. }));
    }

    #[test]
    fn test_pdf_parsing_requires_bytea() {
        let mut doc = minimal();
        doc["parsing"] = json!({"implementation": "pymupdf"});
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert!(matches!(errors[0], ConfigError::PdfNeedsBytea { .. }));
    }

    #[test]
    fn test_document_loading_needs_parser() {
        let mut doc = minimal();
        doc["loading"] = json!({"implementation": "document", "column_name": "body"});
        doc["parsing"] = json!({"implementation": "none"});
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert!(errors.contains(&ConfigError::DocumentWithoutParser));
    }

    #[test]
    fn test_batch_table_collision() {
        let mut doc = minimal();
        doc["embedding"]["use_batch_api"] = json!(true);
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), Some("_vectorizer_embedding_batches_7"));
        assert!(matches!(errors[0], ConfigError::BatchTableExists { .. }));
    }

    #[test]
    fn test_voyageai_input_type() {
        let mut doc = minimal();
        doc["embedding"] = json!({
            "implementation": "voyageai",
            "model": "voyage-3",
            "dimensions": 1024,
            "input_type": "passage"
        });
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert_eq!(errors, vec![ConfigError::BadInputType("passage".to_string())]);

        let mut doc = minimal();
        doc["embedding"] = json!({
            "implementation": "voyageai",
            "model": "voyage-3",
            "dimensions": 1024,
            "input_type": "document"
        });
        let config = VectorizerConfig::from_value(doc).unwrap();
        assert!(config.validate(&columns(), None).is_empty());
    }

    #[test]
    fn test_indexing_requires_scheduler() {
        let mut doc = minimal();
        doc["indexing"] = json!({"implementation": "hnsw"});
        let config = VectorizerConfig::from_value(doc).unwrap();
        let errors = config.validate(&columns(), None);
        assert_eq!(errors, vec![ConfigError::IndexingWithoutScheduler]);

        let mut doc = minimal();
        doc["indexing"] = json!({"implementation": "hnsw"});
        doc["scheduling"] = json!({"implementation": "timescaledb"});
        let config = VectorizerConfig::from_value(doc).unwrap();
        assert!(config.validate(&columns(), None).is_empty());
    }

    #[test]
    fn test_grant_to_roles() {
        assert!(GrantToConfig::Default.roles().is_empty());
        assert_eq!(GrantToConfig::Timescale.roles(), vec!["tsdbadmin"]);
        let explicit = GrantToConfig::Explicit {
            roles: vec!["reader".to_string(), "writer".to_string()],
        };
        assert_eq!(explicit.roles(), vec!["reader", "writer"]);
    }

    #[test]
    fn test_document_loading_payload_column() {
        let mut doc = minimal();
        doc["loading"] = json!({"implementation": "document", "column_name": "doc"});
        let config = VectorizerConfig::from_value(doc).unwrap();
        assert_eq!(config.payload_column(), "doc");
    }

    #[test]
    fn test_config_round_trips() {
        let config = VectorizerConfig::from_value(minimal()).unwrap();
        let serialized = serde_json::to_value(&config).unwrap();
        let reparsed: VectorizerConfig = serde_json::from_value(serialized).unwrap();
        assert_eq!(reparsed, config);
    }
}
