//! Template parsing.
//!
//! Parsing runs in two phases. [`tokenize`] splits the text into optional
//! frontmatter and `(heading, body)` pairs without interpreting anything.
//! [`validate`] then checks those pairs against the section rules in
//! [`schema`](super::schema) and builds the definition.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use super::schema::{
    self, id_regex, is_data_placeholder, is_valid_placeholder_name, list_entry_regex,
    PlaceholderPolicy, Requirement, Section, SectionShape,
};
use super::{DefinitionMeta, ParseError, PromptDefinition, ToolDeclaration, VariableSpec};

/// Parse a template whose metadata lives entirely in its frontmatter.
pub fn parse(raw: &str) -> Result<PromptDefinition, ParseError> {
    parse_with_defaults(raw, &DefinitionMeta::default())
}

/// Parse a template, using catalog metadata for the id and as a fallback for
/// name and description.
pub fn parse_with_defaults(
    raw: &str,
    defaults: &DefinitionMeta,
) -> Result<PromptDefinition, ParseError> {
    let tokens = tokenize(raw)?;
    validate(tokens, defaults)
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug)]
struct Tokens {
    frontmatter: Frontmatter,
    sections: Vec<(String, String)>,
}

/// Split off the frontmatter, returning its metadata and the remaining text.
pub fn split_frontmatter(raw: &str) -> Result<(DefinitionMeta, String), ParseError> {
    let lines: Vec<&str> = raw.lines().map(|l| l.trim_end_matches('\r')).collect();
    let (frontmatter, body_start) = frontmatter_block(&lines)?;
    let meta = DefinitionMeta {
        id: frontmatter.id,
        name: frontmatter.name,
        description: frontmatter.description,
    };
    Ok((meta, lines[body_start.min(lines.len())..].join("\n")))
}

fn frontmatter_block(lines: &[&str]) -> Result<(Frontmatter, usize), ParseError> {
    match lines.first() {
        Some(first) if first.trim_end() == schema::FRONTMATTER_FENCE => {
            let close = lines
                .iter()
                .skip(1)
                .position(|l| l.trim_end() == schema::FRONTMATTER_FENCE)
                .map(|i| i + 1)
                .ok_or_else(|| ParseError::InvalidFrontmatter("missing closing '---'".into()))?;
            let block = lines[1..close].join("\n");
            Ok((parse_frontmatter(&block)?, close + 1))
        }
        _ => Ok((Frontmatter::default(), 0)),
    }
}

fn tokenize(raw: &str) -> Result<Tokens, ParseError> {
    let lines: Vec<&str> = raw.lines().map(|l| l.trim_end_matches('\r')).collect();
    let (frontmatter, body_start) = frontmatter_block(&lines)?;

    let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
    let mut in_fence = false;
    for line in &lines[body_start.min(lines.len())..] {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some(heading) = line.strip_prefix(schema::SECTION_PREFIX) {
                sections.push((heading.trim().to_string(), Vec::new()));
                continue;
            }
        }
        // Text before the first heading is a title/preamble and carries no meaning.
        if let Some((_, body)) = sections.last_mut() {
            body.push(line);
        }
    }

    Ok(Tokens {
        frontmatter,
        sections: sections
            .into_iter()
            .map(|(heading, body)| (heading, body.join("\n").trim().to_string()))
            .collect(),
    })
}

fn parse_frontmatter(block: &str) -> Result<Frontmatter, ParseError> {
    if block.trim().is_empty() {
        return Ok(Frontmatter::default());
    }
    serde_yaml::from_str(block).map_err(|e| ParseError::InvalidFrontmatter(e.to_string()))
}

fn validate(tokens: Tokens, defaults: &DefinitionMeta) -> Result<PromptDefinition, ParseError> {
    let Tokens {
        frontmatter,
        sections: raw_sections,
    } = tokens;

    let id = non_empty(defaults.id.clone())
        .or_else(|| non_empty(frontmatter.id.clone()))
        .ok_or_else(|| ParseError::MissingRequiredSection("id".into()))?;
    if !id_regex().is_match(&id) {
        return Err(ParseError::InvalidId(id));
    }
    let name = non_empty(frontmatter.name)
        .or_else(|| non_empty(defaults.name.clone()))
        .ok_or_else(|| ParseError::MissingRequiredSection("name".into()))?;
    let description = non_empty(frontmatter.description)
        .or_else(|| non_empty(defaults.description.clone()))
        .ok_or_else(|| ParseError::MissingRequiredSection("description".into()))?;

    let mut sections: HashMap<Section, String> = HashMap::new();
    for (heading, body) in raw_sections {
        let Some(section) = Section::from_heading(&heading) else {
            continue;
        };
        if sections.insert(section, body).is_some() {
            return Err(ParseError::DuplicateSection(section.heading().to_string()));
        }
    }

    for section in Section::ALL {
        let rule = section.rule();
        let present = sections.get(&section).is_some_and(|b| !b.is_empty());
        if rule.required == Requirement::Always && !present {
            return Err(ParseError::MissingRequiredSection(format!(
                "## {}",
                section.heading()
            )));
        }
    }

    let variables: Vec<VariableSpec> = list_entries(Section::Variables, &sections)?
        .into_iter()
        .map(|(name, description)| VariableSpec { name, description })
        .collect();
    let mut seen = HashSet::new();
    for var in &variables {
        if !is_valid_placeholder_name(&var.name) || is_data_placeholder(&var.name) {
            return Err(ParseError::InvalidName {
                kind: "variable",
                name: var.name.clone(),
            });
        }
        if !seen.insert(var.name.as_str()) {
            return Err(ParseError::DuplicateVariable(var.name.clone()));
        }
    }

    let mut tools: Vec<ToolDeclaration> = Vec::new();
    for (name, description) in list_entries(Section::Tools, &sections)? {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidName { kind: "tool", name });
        }
        if !tools.iter().any(|t| t.name == name) {
            tools.push(ToolDeclaration { name, description });
        }
    }

    let text = |section: Section| -> Option<String> {
        debug_assert_eq!(section.rule().shape, SectionShape::Text);
        sections.get(&section).filter(|b| !b.is_empty()).cloned()
    };
    let query_template = text(Section::McpQuery).map(|q| unfence(&q));
    let analysis_template = text(Section::AnalysisPrompt).unwrap_or_default();
    let required_analysis = text(Section::RequiredAnalysis);
    let output_format = text(Section::OutputFormat);

    match (tools.is_empty(), query_template.is_some()) {
        (false, false) => {
            return Err(ParseError::InconsistentToolDeclaration(
                "tools are declared but there is no '## MCP Query' section".into(),
            ))
        }
        (true, true) => {
            return Err(ParseError::InconsistentToolDeclaration(
                "'## MCP Query' is present but no tools are declared".into(),
            ))
        }
        _ => {}
    }

    let declared: HashSet<&str> = variables.iter().map(|v| v.name.as_str()).collect();
    let mut data_placeholders: Vec<&str> = Vec::new();
    let checked = [
        (Section::McpQuery, query_template.as_deref()),
        (Section::AnalysisPrompt, Some(analysis_template.as_str())),
        (Section::RequiredAnalysis, required_analysis.as_deref()),
        (Section::OutputFormat, output_format.as_deref()),
    ];
    for (section, body) in checked {
        let Some(body) = body else { continue };
        let policy = section.rule().placeholders;
        for (token, name) in schema::placeholder_tokens(body) {
            if !is_valid_placeholder_name(name) {
                return Err(ParseError::MalformedPlaceholder {
                    section: section.heading().to_string(),
                    token: token.to_string(),
                });
            }
            if is_data_placeholder(name) {
                if policy != PlaceholderPolicy::VariablesAndData {
                    return Err(ParseError::MisplacedDataPlaceholder {
                        section: section.heading().to_string(),
                        name: name.to_string(),
                    });
                }
                data_placeholders.push(name);
            } else if policy == PlaceholderPolicy::None || !declared.contains(name) {
                return Err(ParseError::UndeclaredPlaceholder {
                    section: section.heading().to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    match (tools.is_empty(), data_placeholders.len()) {
        (true, 0) | (false, 1) => {}
        (true, _) => {
            return Err(ParseError::InconsistentToolDeclaration(format!(
                "data placeholder {} is used but no tools are declared",
                schema::placeholder(data_placeholders[0])
            )))
        }
        (false, 0) => {
            return Err(ParseError::InconsistentToolDeclaration(format!(
                "tools are declared but '## Analysis Prompt' has no {} or {} placeholder",
                schema::placeholder(schema::DATA_PLACEHOLDERS[0]),
                schema::placeholder(schema::DATA_PLACEHOLDERS[1])
            )))
        }
        (false, _) => {
            let found = data_placeholders
                .iter()
                .map(|n| schema::placeholder(n))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ParseError::AmbiguousDataPlaceholder(found));
        }
    }

    Ok(PromptDefinition {
        id,
        name,
        description,
        variables,
        tools,
        query_template,
        analysis_template,
        required_analysis,
        output_format,
    })
}

/// Extract ``- `name`: description`` entries from a list section.
fn list_entries(
    section: Section,
    sections: &HashMap<Section, String>,
) -> Result<Vec<(String, String)>, ParseError> {
    debug_assert_eq!(section.rule().shape, SectionShape::List);
    let Some(body) = sections.get(&section) else {
        return Ok(Vec::new());
    };
    if is_none_sentinel(body) {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match list_entry_regex().captures(line) {
            Some(caps) => entries.push((caps[1].trim().to_string(), caps[2].trim().to_string())),
            None if trimmed.starts_with('-') || trimmed.starts_with('*') => {
                return Err(ParseError::MalformedEntry {
                    section: section.heading().to_string(),
                    line: trimmed.to_string(),
                })
            }
            // Prose between entries.
            None => {}
        }
    }
    Ok(entries)
}

/// `None`, `none.`, `None - this prompt only uses the model`, ...
fn is_none_sentinel(body: &str) -> bool {
    let Some(first) = body.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return true;
    };
    let first = first.trim_start_matches(['-', '*']).trim_start();
    let word: String = first
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    word.eq_ignore_ascii_case("none")
}

/// Strip a code fence that wraps the entire body.
fn unfence(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    if lines.len() >= 2
        && lines[0].trim_start().starts_with("```")
        && lines[lines.len() - 1].trim() == "```"
        && !lines[1..lines.len() - 1]
            .iter()
            .any(|l| l.trim_start().starts_with("```"))
    {
        return lines[1..lines.len() - 1].join("\n").trim().to_string();
    }
    body.to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
