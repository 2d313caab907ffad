//! The authoring surface: section headings, placeholder syntax and the
//! declarative rules each section is validated against.
//!
//! Everything here is part of the format template authors write against.
//! Heading text, delimiters and the data placeholder spellings must stay
//! byte-for-byte stable.

use std::sync::OnceLock;

use regex::Regex;

/// Opening delimiter of a placeholder.
pub const PLACEHOLDER_OPEN: &str = "{{";
/// Closing delimiter of a placeholder.
pub const PLACEHOLDER_CLOSE: &str = "}}";

/// Placeholder names that stand for the fetched data payload.
pub const DATA_PLACEHOLDERS: [&str; 2] = ["data", "device_data"];

/// Prefix of a section heading line.
pub const SECTION_PREFIX: &str = "## ";

/// Frontmatter fence.
pub const FRONTMATTER_FENCE: &str = "---";

/// Recognized sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Variables,
    Tools,
    McpQuery,
    AnalysisPrompt,
    RequiredAnalysis,
    OutputFormat,
}

impl Section {
    pub const ALL: [Section; 6] = [
        Section::Variables,
        Section::Tools,
        Section::McpQuery,
        Section::AnalysisPrompt,
        Section::RequiredAnalysis,
        Section::OutputFormat,
    ];

    /// Heading text as it appears after `## `.
    pub fn heading(&self) -> &'static str {
        match self {
            Section::Variables => "Variables",
            Section::Tools => "Tools",
            Section::McpQuery => "MCP Query",
            Section::AnalysisPrompt => "Analysis Prompt",
            Section::RequiredAnalysis => "Required Analysis",
            Section::OutputFormat => "Output Format",
        }
    }

    /// Look a heading up in the vocabulary. Unknown headings return `None`.
    pub fn from_heading(heading: &str) -> Option<Section> {
        Section::ALL.into_iter().find(|s| s.heading() == heading)
    }

    pub fn rule(&self) -> SectionRule {
        match self {
            Section::Variables | Section::Tools => SectionRule {
                shape: SectionShape::List,
                required: Requirement::Optional,
                placeholders: PlaceholderPolicy::None,
            },
            Section::McpQuery => SectionRule {
                shape: SectionShape::Text,
                required: Requirement::WithTools,
                placeholders: PlaceholderPolicy::Variables,
            },
            Section::AnalysisPrompt => SectionRule {
                shape: SectionShape::Text,
                required: Requirement::Always,
                placeholders: PlaceholderPolicy::VariablesAndData,
            },
            Section::RequiredAnalysis | Section::OutputFormat => SectionRule {
                shape: SectionShape::Text,
                required: Requirement::Optional,
                placeholders: PlaceholderPolicy::Variables,
            },
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.heading())
    }
}

/// How a section body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionShape {
    /// ``- `name`: description`` entries, or the `None` sentinel.
    List,
    /// Free text, kept as written (trimmed).
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Always,
    /// Present if and only if the definition declares tools.
    WithTools,
    Optional,
}

/// Which placeholder names may occur in a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderPolicy {
    None,
    Variables,
    VariablesAndData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRule {
    pub shape: SectionShape,
    pub required: Requirement,
    pub placeholders: PlaceholderPolicy,
}

/// Matches `{{name}}`. No inner whitespace is allowed.
pub fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("valid placeholder regex"))
}

/// Matches a list entry such as ``- `mac_address`: MAC address to look up``.
pub fn list_entry_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*]\s*)?`([^`]+)`\s*:\s*(.*)$").expect("valid list entry regex")
    })
}

/// Catalog identifiers: lowercase letters, digits and hyphens.
pub fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid id regex"))
}

pub fn is_data_placeholder(name: &str) -> bool {
    DATA_PLACEHOLDERS.contains(&name)
}

pub fn is_valid_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render a placeholder token for a name.
pub fn placeholder(name: &str) -> String {
    format!("{PLACEHOLDER_OPEN}{name}{PLACEHOLDER_CLOSE}")
}

/// Matches any `{{...}}` token, well-formed or not.
pub fn placeholder_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]*)\}\}").expect("valid placeholder token regex"))
}

/// Every `{{...}}` token in `text` with its inner text, in order of appearance.
pub fn placeholder_tokens(text: &str) -> Vec<(&str, &str)> {
    placeholder_token_regex()
        .captures_iter(text)
        .filter_map(|c| Some((c.get(0)?.as_str(), c.get(1)?.as_str())))
        .collect()
}

/// Names of all placeholders in `text`, in order of appearance.
pub fn placeholders_in(text: &str) -> Vec<&str> {
    placeholder_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}
