//! Prompt catalog on disk.
//!
//! ```text
//! <context>/Prompts.md              index table: | id | name | description |
//! <context>/prompts/<id>.md         builtin templates
//! <context>/prompts/custom/<id>.md  user-saved templates
//! ```
//!
//! Without an index the builtin directory is scanned instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::template::{
    parse_with_defaults, schema::id_regex, split_frontmatter, DefinitionMeta, ParseError,
    PromptDefinition,
};

pub const INDEX_FILE: &str = "Prompts.md";
pub const PROMPTS_DIR: &str = "prompts";
pub const CUSTOM_DIR: &str = "custom";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("prompt '{0}' not found")]
    NotFound(String),

    #[error("invalid prompt id '{0}': use lowercase letters, digits and hyphens")]
    InvalidId(String),

    #[error("prompt id '{0}' belongs to a builtin prompt")]
    Reserved(String),

    #[error("prompt name is required")]
    EmptyName,

    #[error("no prompt template found in the generated output")]
    NoGeneratedTemplate,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Loading a definition fails either finding it or parsing it.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("prompt '{id}' is invalid: {source}")]
    Parse {
        id: String,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    Builtin,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub source: PromptSource,
}

impl CatalogEntry {
    fn meta(&self) -> DefinitionMeta {
        DefinitionMeta {
            id: Some(self.id.clone()),
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
        }
    }
}

/// Catalog rooted at a context directory.
#[derive(Debug, Clone)]
pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: context_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn builtin_dir(&self) -> PathBuf {
        self.root.join(PROMPTS_DIR)
    }

    fn custom_dir(&self) -> PathBuf {
        self.root.join(PROMPTS_DIR).join(CUSTOM_DIR)
    }

    /// Builtin prompts in index order, then custom prompts by id.
    pub fn list_definitions(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut entries = self.builtin_entries()?;
        let builtin: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
        entries.extend(
            scan_dir(&self.custom_dir(), PromptSource::Custom)?
                .into_iter()
                .filter(|e| !builtin.contains(&e.id)),
        );
        Ok(entries)
    }

    /// Raw template text for `id`.
    pub fn load_definition(&self, id: &str) -> Result<String, CatalogError> {
        self.locate(id).map(|(_, text)| text)
    }

    /// Load and parse `id`.
    pub fn load(&self, id: &str) -> Result<PromptDefinition, LoadError> {
        let (entry, text) = self.locate(id)?;
        let defaults = match entry {
            Some(entry) => entry.meta(),
            None => DefinitionMeta {
                id: Some(id.to_string()),
                ..Default::default()
            },
        };
        parse_with_defaults(&text, &defaults).map_err(|source| LoadError::Parse {
            id: id.to_string(),
            source,
        })
    }

    /// Save a template as a custom prompt and return its catalog entry.
    ///
    /// The id is derived from `name` when not given. Any frontmatter in
    /// `content` is replaced by the supplied name and description, and the
    /// result must parse before it is written.
    pub fn save_custom(
        &self,
        name: &str,
        content: &str,
        id: Option<&str>,
        description: &str,
    ) -> Result<CatalogEntry, LoadError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::EmptyName.into());
        }
        let id = id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| slugify(name));
        validate_id(&id)?;
        if self.builtin_entries()?.iter().any(|e| e.id == id) {
            return Err(CatalogError::Reserved(id).into());
        }

        let parse_error = |source| LoadError::Parse {
            id: id.clone(),
            source,
        };
        let (_, body) = split_frontmatter(content).map_err(parse_error)?;
        let entry = CatalogEntry {
            id: id.clone(),
            name: name.to_string(),
            description: description.trim().to_string(),
            source: PromptSource::Custom,
        };
        let text = render_custom(&entry, &body);
        parse_with_defaults(&text, &entry.meta()).map_err(parse_error)?;

        let dir = self.custom_dir();
        std::fs::create_dir_all(&dir).map_err(|source| CatalogError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(format!("{}.md", id));
        std::fs::write(&path, text).map_err(|source| CatalogError::Io { path, source })?;
        tracing::info!(id = %entry.id, "Saved custom prompt");
        Ok(entry)
    }

    /// Save the template found in prompt-builder output as a custom prompt.
    ///
    /// `name` and `id` override what the output suggests. An overridden name
    /// without an id gets an id derived from that name.
    pub fn save_generated(
        &self,
        output: &str,
        name: Option<&str>,
        id: Option<&str>,
    ) -> Result<CatalogEntry, LoadError> {
        let draft = generated_prompt(output).ok_or(CatalogError::NoGeneratedTemplate)?;
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let id = match (id, name) {
            (Some(id), _) => Some(id),
            (None, Some(_)) => None,
            (None, None) => draft.id.as_deref(),
        };
        self.save_custom(
            name.unwrap_or(draft.name.as_str()),
            &draft.content,
            id,
            &draft.description,
        )
    }

    fn builtin_entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let index = self.root.join(INDEX_FILE);
        match std::fs::read_to_string(&index) {
            Ok(text) => Ok(parse_index(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                scan_dir(&self.builtin_dir(), PromptSource::Builtin)
            }
            Err(source) => Err(CatalogError::Io {
                path: index,
                source,
            }),
        }
    }

    fn locate(&self, id: &str) -> Result<(Option<CatalogEntry>, String), CatalogError> {
        validate_id(id)?;
        let listed = self.list_definitions()?.into_iter().find(|e| e.id == id);
        let candidates = [
            self.builtin_dir().join(format!("{}.md", id)),
            self.custom_dir().join(format!("{}.md", id)),
        ];
        for path in candidates {
            match std::fs::read_to_string(&path) {
                Ok(text) => return Ok((listed, text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(CatalogError::Io { path, source }),
            }
        }
        Err(CatalogError::NotFound(id.to_string()))
    }
}

fn validate_id(id: &str) -> Result<(), CatalogError> {
    if id_regex().is_match(id) {
        Ok(())
    } else {
        Err(CatalogError::InvalidId(id.to_string()))
    }
}

/// Rows of the `| id | name | description |` index table.
fn parse_index(text: &str) -> Vec<CatalogEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('|'))
        .filter_map(|line| {
            let cells: Vec<&str> = line.trim_matches('|').split('|').map(str::trim).collect();
            if cells.len() < 3 {
                return None;
            }
            let id = cells[0];
            if id.eq_ignore_ascii_case("id") || id.chars().all(|c| c == '-' || c == ':') {
                return None;
            }
            if !id_regex().is_match(id) {
                tracing::warn!(id = %id, "Skipping index row with invalid prompt id");
                return None;
            }
            Some(CatalogEntry {
                id: id.to_string(),
                name: cells[1].to_string(),
                description: cells[2].to_string(),
                source: PromptSource::Builtin,
            })
        })
        .collect()
}

/// Templates directly inside `dir`, named by their frontmatter.
fn scan_dir(dir: &Path, source: PromptSource) -> Result<Vec<CatalogEntry>, CatalogError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| CatalogError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !id_regex().is_match(id) {
            continue;
        }
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let meta = match split_frontmatter(&text) {
            Ok((meta, _)) => meta,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable prompt frontmatter");
                DefinitionMeta::default()
            }
        };
        entries.push(CatalogEntry {
            id: id.to_string(),
            name: meta.name.unwrap_or_else(|| id.to_string()),
            description: meta.description.unwrap_or_default(),
            source,
        });
    }
    Ok(entries)
}

#[derive(Serialize)]
struct SavedFrontmatter<'a> {
    name: &'a str,
    description: &'a str,
}

fn render_custom(entry: &CatalogEntry, body: &str) -> String {
    let frontmatter = serde_yaml::to_string(&SavedFrontmatter {
        name: &entry.name,
        description: &entry.description,
    })
    .unwrap_or_default();
    format!("---\n{}---\n\n{}\n", frontmatter, body.trim())
}

/// Lowercase-hyphenated id derived from a display name.
pub fn slugify(name: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));
    re.replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Pull a generated template out of model output: the first
/// ```` ```markdown ```` fence, else everything from the first frontmatter
/// fence.
pub fn extract_template(output: &str) -> Option<String> {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    let fenced = FENCED
        .get_or_init(|| Regex::new(r"(?s)```markdown\s*\n(.*?)```").expect("valid regex"));
    if let Some(caps) = fenced.captures(output) {
        return Some(caps[1].trim().to_string());
    }
    output
        .find("---\n")
        .map(|start| output[start..].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// The id in a "Suggested filename: `<id>.md`" line, if the output has one.
pub fn suggested_id(output: &str) -> Option<String> {
    static SUGGESTED: OnceLock<Regex> = OnceLock::new();
    let re = SUGGESTED.get_or_init(|| {
        Regex::new(r"[Ss]uggested filename[:\s]*`?([a-z0-9-]+)\.md`?").expect("valid regex")
    });
    re.captures(output).map(|caps| caps[1].to_string())
}

/// A template found in prompt-builder output, with the defaults to save it under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedPrompt {
    pub name: String,
    /// Suggested id, set only when the name came from the suggested filename.
    pub id: Option<String>,
    pub description: String,
    pub content: String,
}

/// Extract a generated template. The name and description come from its
/// frontmatter; without a name the suggested filename is used.
pub fn generated_prompt(output: &str) -> Option<GeneratedPrompt> {
    let content = extract_template(output)?;
    let meta = split_frontmatter(&content)
        .map(|(meta, _)| meta)
        .unwrap_or_default();
    let (name, id) = match meta.name.filter(|n| !n.trim().is_empty()) {
        Some(name) => (name, None),
        None => {
            let suggested = suggested_id(output);
            let name = suggested.as_deref().map(title_from_id).unwrap_or_default();
            (name, suggested)
        }
    };
    Some(GeneratedPrompt {
        name,
        id,
        description: meta.description.unwrap_or_default(),
        content,
    })
}

fn title_from_id(id: &str) -> String {
    id.split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAC_TEMPLATE: &str = "## Variables\n- `mac_address`: MAC address\n\n## Tools\n- `armis_query`: Device lookup\n\n## MCP Query\nFind {{mac_address}}.\n\n## Analysis Prompt\nAssess:\n{{data}}\n";

    const INDEX: &str = "# Prompts\n\n| ID | Name | Description |\n|----|------|-------------|\n| mac-risk-summarizer | MAC Risk Summarizer | Risk by MAC address |\n| vuln-brief | Vulnerability Brief | CVE overview |\n";

    fn fixture(with_index: bool) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let prompts = dir.path().join(PROMPTS_DIR);
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::write(prompts.join("mac-risk-summarizer.md"), MAC_TEMPLATE).unwrap();
        std::fs::write(
            prompts.join("vuln-brief.md"),
            "---\nname: Vuln Brief\ndescription: From frontmatter\n---\n## Analysis Prompt\nSummarize CVE handling.",
        )
        .unwrap();
        if with_index {
            std::fs::write(dir.path().join(INDEX_FILE), INDEX).unwrap();
        }
        dir
    }

    #[test]
    fn index_table_lists_builtins_in_order() {
        let dir = fixture(true);
        let entries = DirCatalog::new(dir.path()).list_definitions().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["mac-risk-summarizer", "vuln-brief"]);
        assert_eq!(entries[0].name, "MAC Risk Summarizer");
        assert_eq!(entries[0].source, PromptSource::Builtin);
    }

    #[test]
    fn without_index_the_directory_is_scanned() {
        let dir = fixture(false);
        let entries = DirCatalog::new(dir.path()).list_definitions().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "mac-risk-summarizer");
        assert_eq!(entries[1].name, "Vuln Brief");
        assert_eq!(entries[1].description, "From frontmatter");
    }

    #[test]
    fn load_uses_index_row_as_defaults() {
        let dir = fixture(true);
        let def = DirCatalog::new(dir.path()).load("mac-risk-summarizer").unwrap();
        assert_eq!(def.id(), "mac-risk-summarizer");
        assert_eq!(def.name(), "MAC Risk Summarizer");
        assert!(def.requires_tools());

        // frontmatter wins over the index row
        let brief = DirCatalog::new(dir.path()).load("vuln-brief").unwrap();
        assert_eq!(brief.name(), "Vuln Brief");
    }

    #[test]
    fn missing_invalid_and_broken_prompts_are_distinguished() {
        let dir = fixture(true);
        let catalog = DirCatalog::new(dir.path());
        assert!(matches!(
            catalog.load_definition("nope"),
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            catalog.load_definition("../Prompts"),
            Err(CatalogError::InvalidId(_))
        ));

        std::fs::write(
            dir.path().join(PROMPTS_DIR).join("broken.md"),
            "## Variables\n- `x`: X\n",
        )
        .unwrap();
        match catalog.load("broken") {
            Err(LoadError::Parse { id, source }) => {
                assert_eq!(id, "broken");
                assert!(matches!(source, ParseError::MissingRequiredSection(_)));
            }
            other => panic!("unexpected: {:?}", other),
        }
        // the broken file does not affect the others
        assert!(catalog.load("vuln-brief").is_ok());
    }

    #[test]
    fn save_custom_writes_frontmatter_and_lists_after_builtins() {
        let dir = fixture(true);
        let catalog = DirCatalog::new(dir.path());
        let generated = format!("---\nname: Old\n---\n{}", MAC_TEMPLATE);
        let entry = catalog
            .save_custom("Camera Exposure", &generated, None, "Cameras on the internet")
            .unwrap();
        assert_eq!(entry.id, "camera-exposure");

        let saved = catalog.load_definition("camera-exposure").unwrap();
        assert!(saved.starts_with("---\nname: Camera Exposure\n"));
        assert!(!saved.contains("name: Old"));

        let def = catalog.load("camera-exposure").unwrap();
        assert_eq!(def.description(), "Cameras on the internet");

        let entries = catalog.list_definitions().unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.id, "camera-exposure");
        assert_eq!(last.source, PromptSource::Custom);
    }

    #[test]
    fn save_custom_refuses_builtin_ids_and_bad_templates() {
        let dir = fixture(true);
        let catalog = DirCatalog::new(dir.path());
        assert!(matches!(
            catalog.save_custom("x", MAC_TEMPLATE, Some("vuln-brief"), ""),
            Err(LoadError::Catalog(CatalogError::Reserved(_)))
        ));
        assert!(matches!(
            catalog.save_custom("x", MAC_TEMPLATE, Some("Bad_Id"), ""),
            Err(LoadError::Catalog(CatalogError::InvalidId(_)))
        ));
        assert!(matches!(
            catalog.save_custom("No Analysis", "## Variables\nNone", None, "d"),
            Err(LoadError::Parse { .. })
        ));
        assert!(!dir.path().join(PROMPTS_DIR).join(CUSTOM_DIR).join("no-analysis.md").exists());
    }

    #[test]
    fn extract_template_prefers_markdown_fence() {
        let output = "Here you go:\n```markdown\n---\nname: A\n---\n## Analysis Prompt\nHi\n```\nSuggested filename: `a-prompt.md`";
        assert_eq!(
            extract_template(output).unwrap(),
            "---\nname: A\n---\n## Analysis Prompt\nHi"
        );
        assert_eq!(suggested_id(output).as_deref(), Some("a-prompt"));

        let bare = "Sure.\n---\nname: B\n---\n## Analysis Prompt\nYo";
        assert!(extract_template(bare).unwrap().starts_with("---\nname: B"));
        assert_eq!(extract_template("no template here"), None);
    }

    const GENERATED: &str = "Here is your prompt.\n\n```markdown\n---\nname: Camera Exposure\ndescription: Internet-facing cameras\n---\n\n## Variables\n- `site`: Site name\n\n## Tools\n- `armis_query`: Device lookup\n\n## MCP Query\nCameras at {{site}} with public IPs.\n\n## Analysis Prompt\nAssess exposure:\n{{data}}\n```\n\nSuggested filename: `camera-exposure-check.md`\n";

    #[test]
    fn generated_prompt_reads_frontmatter_first() {
        let draft = generated_prompt(GENERATED).unwrap();
        assert_eq!(draft.name, "Camera Exposure");
        assert_eq!(draft.id, None);
        assert_eq!(draft.description, "Internet-facing cameras");
        assert!(draft.content.starts_with("---\nname: Camera Exposure"));

        let unnamed = GENERATED.replace("name: Camera Exposure\n", "");
        let draft = generated_prompt(&unnamed).unwrap();
        assert_eq!(draft.name, "Camera Exposure Check");
        assert_eq!(draft.id.as_deref(), Some("camera-exposure-check"));
    }

    #[test]
    fn generated_output_is_saved_as_custom_prompt() {
        let dir = fixture(true);
        let catalog = DirCatalog::new(dir.path());

        let entry = catalog.save_generated(GENERATED, None, None).unwrap();
        assert_eq!(entry.id, "camera-exposure");
        assert_eq!(entry.source, PromptSource::Custom);
        let definition = catalog.load("camera-exposure").unwrap();
        assert_eq!(definition.name(), "Camera Exposure");
        assert_eq!(definition.variables()[0].name, "site");

        let renamed = catalog
            .save_generated(GENERATED, Some("Exposed Cameras"), None)
            .unwrap();
        assert_eq!(renamed.id, "exposed-cameras");

        assert!(matches!(
            catalog.save_generated("I could not write a prompt.", None, None),
            Err(LoadError::Catalog(CatalogError::NoGeneratedTemplate))
        ));
    }

    #[test]
    fn shipped_context_prompts_parse() {
        let catalog = DirCatalog::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("context"));
        let entries = catalog.list_definitions().unwrap();
        assert!(entries.iter().any(|e| e.id == "mac-risk-summarizer"));
        assert!(entries.iter().any(|e| e.id == "prompt-builder"));
        for entry in entries {
            catalog.load(&entry.id).unwrap();
        }
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("  MAC -- Risk (v2) "), "mac-risk-v2");
    }
}
