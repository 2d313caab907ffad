//! Persona context for the system prompt.

use std::io;
use std::path::Path;

const PERSONA_FILES: [&str; 2] = ["Role.md", "Rules.md"];

/// Analyst role and house rules, sent verbatim as the system message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Persona {
    text: String,
}

impl Persona {
    /// Load `Role.md` and `Rules.md` from `context_dir`. Missing files are
    /// skipped; other read errors are returned.
    pub fn load(context_dir: &Path) -> io::Result<Self> {
        let mut parts = Vec::new();
        for name in PERSONA_FILES {
            match std::fs::read_to_string(context_dir.join(name)) {
                Ok(text) => parts.push(text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(file = name, "Persona file not found, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            text: parts.join("\n\n"),
        })
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn system_prompt(&self) -> &str {
        &self.text
    }
}
