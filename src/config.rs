use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::content::DEFAULT_CONTENT_CHUNK_SIZE;
use crate::error::ReconcileError;
use crate::priority::{
    ContentPriority, PriorityTable, default_source_priority, default_text_type_priority,
};
use crate::reconcile::{ConflictPolicy, DEFAULT_CHUNK_SIZE, ReconcileOptions};

pub const DEFAULT_CONFIG_FILE: &str = "textref.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub content_chunk_size: Option<usize>,
    #[serde(default)]
    pub merge_compatible_input: Option<bool>,
    #[serde(default)]
    pub field_conflicts: Option<ConflictPolicy>,
    #[serde(default)]
    pub require_doi: Option<bool>,
    #[serde(default)]
    pub exclude_dois: Option<Vec<String>>,
    #[serde(default)]
    pub source_tag: Option<String>,
    #[serde(default)]
    pub text_type_priority: Option<PriorityTable>,
    #[serde(default)]
    pub source_priority: Option<PriorityTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub reconcile: ReconcileOptions,
    pub content_chunk_size: usize,
    pub require_doi: bool,
    pub exclude_dois: Vec<String>,
    pub source_tag: String,
    pub priority: ContentPriority,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            reconcile: ReconcileOptions::default(),
            content_chunk_size: DEFAULT_CONTENT_CHUNK_SIZE,
            require_doi: false,
            exclude_dois: default_exclude_dois(),
            source_tag: "cord19".to_string(),
            priority: ContentPriority::default(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `textref.json` in the working directory when it exists.
    /// Without either, the defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ReconcileError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ReconcileError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ReconcileError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ReconcileError> {
        let chunk_size = config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let content_chunk_size = config
            .content_chunk_size
            .unwrap_or(DEFAULT_CONTENT_CHUNK_SIZE);
        if chunk_size == 0 || content_chunk_size == 0 {
            return Err(ReconcileError::InvalidChunkSize);
        }

        let source_tag = config
            .source_tag
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(|| "cord19".to_string());

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            reconcile: ReconcileOptions {
                chunk_size,
                merge_compatible_input: config.merge_compatible_input.unwrap_or(true),
                field_conflicts: config.field_conflicts.unwrap_or_default(),
            },
            content_chunk_size,
            require_doi: config.require_doi.unwrap_or(false),
            exclude_dois: config.exclude_dois.unwrap_or_else(default_exclude_dois),
            source_tag,
            priority: ContentPriority {
                text_type: config
                    .text_type_priority
                    .unwrap_or_else(default_text_type_priority),
                source: config
                    .source_priority
                    .unwrap_or_else(default_source_priority),
            },
        })
    }
}

/// A record known to be mislabelled in the CORD-19 feed.
pub fn default_exclude_dois() -> Vec<String> {
    vec!["0.1126/SCIENCE.ABB7331".to_string()]
}
