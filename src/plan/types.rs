//! Approved plan input types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::{CoordError, Result};

/// One ordered step of an approved plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    /// Files this step is expected to touch
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub sector: Option<String>,
    /// Ids of earlier steps that must settle first
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub estimated_tokens: u64,
}

impl Step {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            files: Vec::new(),
            sector: None,
            dependencies: Vec::new(),
            priority: 0,
            estimated_tokens: 0,
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    /// Add a single step dependency
    pub fn with_dep(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }
}

/// An approved work plan, immutable for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub estimated_tokens: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            steps: Vec::new(),
            estimated_tokens: 0,
            created_at: Utc::now(),
            approved_at: None,
        }
    }

    /// Append a step, folding its estimate into the plan total
    pub fn with_step(mut self, step: Step) -> Self {
        self.estimated_tokens += step.estimated_tokens;
        self.steps.push(step);
        self
    }

    pub fn approved(mut self) -> Self {
        self.approved_at = Some(Utc::now());
        self
    }

    pub fn is_approved(&self) -> bool {
        self.approved_at.is_some()
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoordError::io(format!("read plan {}", path.display()), e))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }
}
