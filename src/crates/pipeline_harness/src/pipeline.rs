use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::synth::FieldSet;

static PLUGIN_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s{])id\s*=>\s*["']([^"']+)["']"#).expect("plugin id pattern is valid")
});

fn default_codec() -> String {
    "json_lines".to_string()
}

/// One pipeline of the topology under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub id: String,
    /// Config files or directories making up the pipeline.
    pub config: Vec<PathBuf>,
}

impl PipelineSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: Vec::new(),
        }
    }

    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.push(path.into());
        self
    }
}

/// Everything a daemon needs to start an engine for a test session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub pipelines: Vec<PipelineSpec>,
    /// Codec the engine uses to decode input lines.
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Fields added to every input event.
    #[serde(default)]
    pub fields: FieldSet,
    /// Number of executions the session can serve; daemon default if unset.
    #[serde(default)]
    pub slots: Option<usize>,
}

impl PipelineDescriptor {
    pub fn new(pipeline: PipelineSpec) -> Self {
        Self {
            pipelines: vec![pipeline],
            codec: default_codec(),
            fields: FieldSet::new(),
            slots: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineSpec) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_fields(mut self, fields: FieldSet) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = Some(slots);
        self
    }

    /// All config sources across the topology, in declaration order.
    pub fn config_sources(&self) -> impl Iterator<Item = &PathBuf> {
        self.pipelines.iter().flat_map(|pipeline| pipeline.config.iter())
    }

    /// Check the topology before any engine is started.
    ///
    /// Pipeline ids must be unique, and so must plugin `id => "..."`
    /// declarations across every config file of every pipeline.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.pipelines.is_empty() {
            return Err(HarnessError::descriptor("no pipelines given"));
        }
        if self.codec.trim().is_empty() {
            return Err(HarnessError::descriptor("codec must not be empty"));
        }
        if self.slots == Some(0) {
            return Err(HarnessError::descriptor("slots must be at least 1"));
        }

        let mut pipeline_ids = BTreeSet::new();
        let mut plugin_ids: BTreeMap<String, String> = BTreeMap::new();
        for pipeline in &self.pipelines {
            if pipeline.id.trim().is_empty() {
                return Err(HarnessError::descriptor("pipeline id must not be empty"));
            }
            if !pipeline_ids.insert(pipeline.id.as_str()) {
                return Err(HarnessError::descriptor(format!(
                    "duplicate pipeline id {}",
                    pipeline.id
                )));
            }
            if pipeline.config.is_empty() {
                return Err(HarnessError::descriptor(format!(
                    "pipeline {} has no config",
                    pipeline.id
                )));
            }

            for source in &pipeline.config {
                for plugin_id in plugin_ids_in(source)? {
                    if let Some(owner) = plugin_ids.insert(plugin_id.clone(), pipeline.id.clone()) {
                        return Err(HarnessError::descriptor(format!(
                            "plugin id {plugin_id} is declared in pipeline {owner} and again in {}",
                            pipeline.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> HarnessResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> HarnessResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| HarnessError::descriptor(format!("cannot decode descriptor: {err}")))
    }
}

fn plugin_ids_in(source: &Path) -> HarnessResult<Vec<String>> {
    let unreadable =
        |err: std::io::Error| HarnessError::descriptor(format!("{}: {err}", source.display()));

    let mut files = Vec::new();
    if fs::metadata(source).map_err(unreadable)?.is_dir() {
        for entry in fs::read_dir(source).map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            if entry.file_type().map_err(unreadable)?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
    } else {
        files.push(source.to_path_buf());
    }

    let mut ids = Vec::new();
    for file in files {
        let text = fs::read_to_string(&file).map_err(unreadable)?;
        ids.extend(
            PLUGIN_ID
                .captures_iter(&text)
                .map(|captures| captures[1].to_string()),
        );
    }
    Ok(ids)
}
