//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogEntry;
use crate::history::RunStatus;
use crate::template::{Bindings, PromptDefinition};

/// Request to start a run. Exactly one of `prompt_id`, `content` or
/// `question` must be given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRunRequest {
    /// Catalog prompt to run
    pub prompt_id: Option<String>,

    /// Raw template text, e.g. an edited prompt
    pub content: Option<String>,

    /// Free-form question
    pub question: Option<String>,

    #[serde(default)]
    pub variables: Bindings,

    /// Optional model override (uses default if not specified)
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub id: String,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub variables: Bindings,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub preview: String,
    /// Declared variables that have no value yet
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptDetail {
    #[serde(flatten)]
    pub definition: PromptDefinition,
    pub raw: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SavePromptRequest {
    pub name: String,
    pub content: String,
    pub id: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Overrides for saving a generated prompt. Both default to what the run's
/// output suggests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveGeneratedRequest {
    pub name: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptListResponse {
    pub prompts: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRunsResponse {
    pub deleted: usize,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model: String,
}
