use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_INPUT_WIDTH: u32 = 300;
pub const DEFAULT_INPUT_HEIGHT: u32 = 300;

/// Registry entry as written in configuration. Paths are relative to the
/// model directory unless absolute.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub model: String,
    pub labels: String,
    #[serde(default = "default_input_width")]
    pub input_width: u32,
    #[serde(default = "default_input_height")]
    pub input_height: u32,
}

fn default_input_width() -> u32 {
    DEFAULT_INPUT_WIDTH
}

fn default_input_height() -> u32 {
    DEFAULT_INPUT_HEIGHT
}

/// Fully resolved model location handed to a `ModelLoader`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub job_type: String,
    pub model_file: PathBuf,
    pub label_file: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
}

/// Static `job_type -> model` mapping rooted under a model directory.
///
/// Built once from configuration and never mutated at runtime.
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    root: PathBuf,
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>, entries: BTreeMap<String, ModelEntry>) -> Self {
        Self {
            root: root.into(),
            entries,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.entries.contains_key(job_type)
    }

    /// Registered job types in sorted order.
    pub fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Resolve a job type to concrete file paths.
    pub fn spec(&self, job_type: &str) -> Option<ModelSpec> {
        let entry = self.entries.get(job_type)?;
        Some(ModelSpec {
            job_type: job_type.to_string(),
            model_file: self.root.join(&entry.model),
            label_file: self.root.join(&entry.labels),
            input_width: entry.input_width,
            input_height: entry.input_height,
        })
    }
}

/// Class id to human-readable label.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels {
    names: HashMap<i32, String>,
}

impl Labels {
    /// Read a label file of `<id> <name>` lines. Blank lines are skipped;
    /// any other line that does not match is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read label file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid label file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        static LABEL_RE: OnceLock<regex::Regex> = OnceLock::new();
        let re = LABEL_RE.get_or_init(|| {
            regex::Regex::new(r"^\s*(\d+)[\s:]+(\S.*?)\s*$").expect("static label regex")
        });

        let mut names = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let caps = re
                .captures(line)
                .ok_or_else(|| anyhow!("line {}: expected '<id> <label>'", lineno + 1))?;
            let id: i32 = caps[1]
                .parse()
                .map_err(|e| anyhow!("line {}: bad class id: {}", lineno + 1, e))?;
            names.insert(id, caps[2].to_string());
        }
        if names.is_empty() {
            return Err(anyhow!("no labels found"));
        }
        Ok(Self { names })
    }

    pub fn get(&self, class_id: i32) -> Option<&str> {
        self.names.get(&class_id).map(String::as_str)
    }

    /// Label for logging; falls back to the numeric id.
    pub fn display(&self, class_id: i32) -> String {
        self.get(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| class_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
