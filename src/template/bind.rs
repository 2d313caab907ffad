//! Variable binding.
//!
//! Substitution is one left-to-right pass over the template text. Replacement
//! values are inserted verbatim and never rescanned, so a value containing
//! `{{` cannot expand into another placeholder.

use std::collections::HashMap;

use regex::Captures;
use thiserror::Error;

use super::schema::{self, is_data_placeholder, Section};
use super::PromptDefinition;

/// User-supplied variable values, keyed by variable name.
pub type Bindings = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("missing value for variable '{0}'")]
    MissingVariable(String),

    #[error("prompt '{0}' declares tools but no data was supplied for the analysis")]
    MissingData(String),

    #[error("prompt '{0}' declares no tools but data was supplied for the analysis")]
    UnexpectedData(String),

    #[error("analysis prompt of '{id}' must contain {expected} data placeholder(s), found {found}")]
    DataPlaceholderCount {
        id: String,
        expected: usize,
        found: usize,
    },
}

/// Ensure every declared variable has a non-blank value.
pub fn check_bindings(definition: &PromptDefinition, bindings: &Bindings) -> Result<(), BindError> {
    for var in definition.variables() {
        match bindings.get(&var.name) {
            Some(value) if !value.trim().is_empty() => {}
            _ => return Err(BindError::MissingVariable(var.name.clone())),
        }
    }
    Ok(())
}

/// Render the data-fetch query. Returns `None` for model-only definitions.
pub fn bind_query(
    definition: &PromptDefinition,
    bindings: &Bindings,
) -> Result<Option<String>, BindError> {
    check_bindings(definition, bindings)?;
    Ok(definition
        .query_template()
        .map(|q| substitute(definition, q, bindings, None)))
}

/// Render the analysis prompt sent to the model as the first user message.
///
/// `data` must be present exactly when the definition declares tools. The
/// Required Analysis and Output Format sections follow the analysis body
/// under their own headings.
pub fn bind_analysis(
    definition: &PromptDefinition,
    bindings: &Bindings,
    data: Option<&str>,
) -> Result<String, BindError> {
    check_bindings(definition, bindings)?;

    let found = schema::placeholders_in(definition.analysis_template())
        .into_iter()
        .filter(|n| is_data_placeholder(n))
        .count();
    let expected = usize::from(definition.requires_tools());
    if found != expected {
        return Err(BindError::DataPlaceholderCount {
            id: definition.id().to_string(),
            expected,
            found,
        });
    }
    match (definition.requires_tools(), data) {
        (true, None) => return Err(BindError::MissingData(definition.id().to_string())),
        (false, Some(_)) => return Err(BindError::UnexpectedData(definition.id().to_string())),
        _ => {}
    }

    let mut prompt = substitute(definition, definition.analysis_template(), bindings, data);
    append_trailing_sections(&mut prompt, definition, bindings);
    Ok(prompt)
}

/// Render every section for display. Missing variables and the data
/// placeholder stay as literal placeholders.
pub fn preview(definition: &PromptDefinition, bindings: &Bindings) -> String {
    let mut out = String::new();
    if let Some(query) = definition.query_template() {
        out.push_str(schema::SECTION_PREFIX);
        out.push_str(Section::McpQuery.heading());
        out.push('\n');
        out.push_str(&substitute(definition, query, bindings, None));
        out.push_str("\n\n");
    }
    out.push_str(schema::SECTION_PREFIX);
    out.push_str(Section::AnalysisPrompt.heading());
    out.push('\n');
    out.push_str(&substitute(
        definition,
        definition.analysis_template(),
        bindings,
        None,
    ));
    append_trailing_sections(&mut out, definition, bindings);
    out
}

fn append_trailing_sections(out: &mut String, definition: &PromptDefinition, bindings: &Bindings) {
    let trailing = [
        (Section::RequiredAnalysis, definition.required_analysis()),
        (Section::OutputFormat, definition.output_format()),
    ];
    for (section, body) in trailing {
        if let Some(body) = body {
            out.push_str("\n\n");
            out.push_str(schema::SECTION_PREFIX);
            out.push_str(section.heading());
            out.push('\n');
            out.push_str(&substitute(definition, body, bindings, None));
        }
    }
}

fn substitute(
    definition: &PromptDefinition,
    text: &str,
    bindings: &Bindings,
    data: Option<&str>,
) -> String {
    schema::placeholder_regex()
        .replace_all(text, |caps: &Captures<'_>| {
            let name = &caps[1];
            if is_data_placeholder(name) {
                if let Some(data) = data {
                    return data.to_string();
                }
            } else if definition.declares_variable(name) {
                if let Some(value) = bindings.get(name).filter(|v| !v.trim().is_empty()) {
                    return value.clone();
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{parse_with_defaults, DefinitionMeta};

    fn definition(raw: &str) -> PromptDefinition {
        parse_with_defaults(
            raw,
            &DefinitionMeta {
                id: Some("test-prompt".into()),
                name: Some("Test".into()),
                description: Some("Test prompt".into()),
            },
        )
        .expect("template parses")
    }

    fn device_query() -> PromptDefinition {
        definition(
            r#"## Variables
- `mac_address`: MAC address

## Tools
- `device-query`: Device lookup

## MCP Query
Find the device with MAC address {{mac_address}}.

## Analysis Prompt
Assess {{mac_address}} using:
{{data}}

## Output Format
Table for {{mac_address}}.
"#,
        )
    }

    fn model_only() -> PromptDefinition {
        definition("## Variables\n- `topic`: Topic\n\n## Analysis Prompt\nExplain {{topic}}.")
    }

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn query_contains_literal_mac_and_no_residual_placeholder() {
        let def = device_query();
        let query = bind_query(&def, &bindings(&[("mac_address", "AA:BB:CC:DD:EE:FF")]))
            .unwrap()
            .unwrap();
        assert!(query.contains("AA:BB:CC:DD:EE:FF"));
        assert!(!query.contains("{{mac_address}}"));
    }

    #[test]
    fn missing_variable_fails_before_rendering() {
        let def = device_query();
        assert_eq!(
            bind_query(&def, &Bindings::new()).unwrap_err(),
            BindError::MissingVariable("mac_address".into())
        );
        assert_eq!(
            bind_query(&def, &bindings(&[("mac_address", "   ")])).unwrap_err(),
            BindError::MissingVariable("mac_address".into())
        );
    }

    #[test]
    fn extra_bindings_are_ignored() {
        let def = model_only();
        let out = bind_analysis(
            &def,
            &bindings(&[("topic", "VLAN hopping"), ("unused", "x")]),
            None,
        )
        .unwrap();
        assert_eq!(out, "Explain VLAN hopping.");
    }

    #[test]
    fn analysis_receives_data_and_trailing_sections() {
        let def = device_query();
        let out = bind_analysis(
            &def,
            &bindings(&[("mac_address", "AA:BB:CC:DD:EE:FF")]),
            Some("{\"risk\": 80}"),
        )
        .unwrap();
        assert_eq!(
            out,
            "Assess AA:BB:CC:DD:EE:FF using:\n{\"risk\": 80}\n\n## Output Format\nTable for AA:BB:CC:DD:EE:FF."
        );
    }

    #[test]
    fn data_presence_must_match_tool_declaration() {
        let b = bindings(&[("mac_address", "AA:BB:CC:DD:EE:FF"), ("topic", "t")]);
        assert_eq!(
            bind_analysis(&device_query(), &b, None).unwrap_err(),
            BindError::MissingData("test-prompt".into())
        );
        assert_eq!(
            bind_analysis(&model_only(), &b, Some("payload")).unwrap_err(),
            BindError::UnexpectedData("test-prompt".into())
        );
    }

    #[test]
    fn values_are_inserted_verbatim_without_rescanning() {
        let def = device_query();
        let b = bindings(&[("mac_address", "{{data}} $1 {{mac_address}}")]);
        let query = bind_query(&def, &b).unwrap().unwrap();
        assert_eq!(
            query,
            "Find the device with MAC address {{data}} $1 {{mac_address}}."
        );

        let analysis = bind_analysis(&def, &b, Some("{{mac_address}}")).unwrap();
        assert!(analysis.starts_with("Assess {{data}} $1 {{mac_address}} using:\n{{mac_address}}"));
    }

    #[test]
    fn binding_is_referentially_transparent() {
        let def = device_query();
        let b = bindings(&[("mac_address", "00:11:22:33:44:55")]);
        assert_eq!(bind_query(&def, &b), bind_query(&def, &b));
        assert_eq!(
            bind_analysis(&def, &b, Some("rows")),
            bind_analysis(&def, &b, Some("rows"))
        );
    }

    #[test]
    fn preview_keeps_unbound_placeholders() {
        let def = device_query();
        let out = preview(&def, &Bindings::new());
        assert!(out.starts_with("## MCP Query\nFind the device with MAC address {{mac_address}}."));
        assert!(out.contains("## Analysis Prompt\nAssess {{mac_address}} using:\n{{data}}"));
        assert!(out.ends_with("## Output Format\nTable for {{mac_address}}."));

        let bound = preview(&def, &bindings(&[("mac_address", "AA:BB:CC:DD:EE:FF")]));
        assert!(!bound.contains("{{mac_address}}"));
        assert!(bound.contains("{{data}}"));
    }
}
