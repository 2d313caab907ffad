//! # Armis MCP Client
//!
//! Template-driven security analysis: a prompt template turns user input into
//! a query against the Armis device inventory (an MCP endpoint), and a local
//! Ollama model reasons over the returned data to write a report.
//!
//! This library provides:
//! - A strict template model with variable binding ([`template`])
//! - A tool-calling agent loop with bounded retries and cancellation ([`agent`])
//! - An MCP client over streamable HTTP ([`tools`]) and an Ollama client ([`llm`])
//! - A prompt catalog, run history and an HTTP API
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use armis_mcp_client::{agent::{Analyst, Persona, RunContext}, catalog::DirCatalog,
//!     config::Config, llm::OllamaClient, tools::McpConnector};
//!
//! let config = Config::from_env()?;
//! let analyst = Analyst::new(
//!     Arc::new(OllamaClient::new(&config.ollama_host)),
//!     Arc::new(McpConnector::from_config(&config)),
//!     Persona::load(&config.context_dir)?,
//!     config.loop_policy(),
//! );
//! let catalog = DirCatalog::new(&config.context_dir);
//! let bindings = [("mac_address".to_string(), "AA:BB:CC:DD:EE:FF".to_string())].into();
//! let outcome = analyst
//!     .run_prompt(&catalog, "mac-risk-summarizer", &bindings, &RunContext::new("mistral"))
//!     .await?;
//! ```

pub mod agent;
pub mod api;
pub mod catalog;
pub mod config;
pub mod history;
pub mod llm;
pub mod template;
pub mod tools;

pub use config::Config;
