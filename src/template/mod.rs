//! Prompt templates.
//!
//! A template is a markdown file with YAML frontmatter and a fixed set of
//! `## ` sections:
//!
//! ```text
//! ---
//! name: MAC Risk Summarizer
//! description: Summarize the risk posture of a device by MAC address
//! ---
//!
//! ## Variables
//! - `mac_address`: MAC address of the device
//!
//! ## Tools
//! - `armis_query`: Natural-language device query
//!
//! ## MCP Query
//! Find the device with MAC address {{mac_address}} ...
//!
//! ## Analysis Prompt
//! Summarize the risk of this device:
//! {{device_data}}
//! ```
//!
//! [`parse`] turns the text into a validated [`PromptDefinition`]; the
//! [`bind`] module substitutes user variables and fetched data.

pub mod bind;
mod parse;
pub mod schema;

use serde::Serialize;
use thiserror::Error;

pub use bind::{bind_analysis, bind_query, check_bindings, preview, BindError, Bindings};
pub use parse::{parse, parse_with_defaults, split_frontmatter};

/// A declared user variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableSpec {
    pub name: String,
    pub description: String,
}

/// A declared tool identifier with its authoring description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
}

/// Metadata the catalog knows about a template before it is parsed.
///
/// The catalog position is authoritative for `id`; `name` and `description`
/// are used only when the frontmatter does not provide them.
#[derive(Debug, Clone, Default)]
pub struct DefinitionMeta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

/// A parsed and validated prompt template.
///
/// Only [`parse`] constructs this type, so every value satisfies:
/// - tools declared ⇔ a query template exists;
/// - tools declared ⇔ the analysis template holds exactly one data placeholder;
/// - every `{{...}}` token is a well-formed placeholder;
/// - every placeholder names a declared variable (or is the data placeholder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptDefinition {
    id: String,
    name: String,
    description: String,
    variables: Vec<VariableSpec>,
    tools: Vec<ToolDeclaration>,
    query_template: Option<String>,
    analysis_template: String,
    required_analysis: Option<String>,
    output_format: Option<String>,
}

impl PromptDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub fn tools(&self) -> &[ToolDeclaration] {
        &self.tools
    }

    /// Declared tool names, in declaration order.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    /// Whether the definition fetches data before analysis.
    pub fn requires_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn query_template(&self) -> Option<&str> {
        self.query_template.as_deref()
    }

    pub fn analysis_template(&self) -> &str {
        &self.analysis_template
    }

    pub fn required_analysis(&self) -> Option<&str> {
        self.required_analysis.as_deref()
    }

    pub fn output_format(&self) -> Option<&str> {
        self.output_format.as_deref()
    }

    pub fn declares_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v.name == name)
    }
}

/// Reasons a template is rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing required section or field: {0}")]
    MissingRequiredSection(String),

    #[error("inconsistent tool declaration: {0}")]
    InconsistentToolDeclaration(String),

    #[error("placeholder {{{{{name}}}}} in section '{section}' is not a declared variable")]
    UndeclaredPlaceholder { section: String, name: String },

    #[error("malformed placeholder '{token}' in section '{section}'")]
    MalformedPlaceholder { section: String, token: String },

    #[error("data placeholder {{{{{name}}}}} is only allowed in '## Analysis Prompt', found in '{section}'")]
    MisplacedDataPlaceholder { section: String, name: String },

    #[error("analysis prompt must contain exactly one data placeholder, found {0}")]
    AmbiguousDataPlaceholder(String),

    #[error("section '## {0}' appears more than once")]
    DuplicateSection(String),

    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),

    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    #[error("malformed entry in '## {section}': {line}")]
    MalformedEntry { section: String, line: String },

    #[error("invalid frontmatter: {0}")]
    InvalidFrontmatter(String),

    #[error("invalid id '{0}': use lowercase letters, digits and hyphens")]
    InvalidId(String),
}
