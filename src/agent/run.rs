//! Analysis pipeline: template, binding, data fetch, conversation.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::agent_loop::{invoke_with_retry, LogEntryType, Orchestrator, RunFailure, RunLog, RunOutcome};
use super::prompt::Persona;
use crate::catalog::{DirCatalog, LoadError};
use crate::llm::LlmClient;
use crate::template::{
    self, bind_analysis, bind_query, check_bindings, BindError, Bindings, DefinitionMeta,
    ParseError, PromptDefinition,
};
use crate::tools::{query_arguments, resolve_all, resolve_tools, ToolAdapter, ToolConnector, ToolError, ToolSpec};

use super::LoopPolicy;

/// Data payload used when the endpoint answers with nothing.
pub const NO_DATA: &str = "No data returned from Armis.";

/// Errors raised before a run starts. Nothing has touched the network.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("invalid prompt: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("question is empty")]
    EmptyQuestion,
}

/// Parse template text that has no catalog entry, such as an edited or
/// generated prompt.
pub fn parse_content(raw: &str) -> Result<PromptDefinition, ParseError> {
    template::parse_with_defaults(
        raw,
        &DefinitionMeta {
            id: Some("custom".to_string()),
            name: Some("Custom prompt".to_string()),
            description: Some("Edited or generated prompt".to_string()),
        },
    )
}

/// Per-run inputs threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub model: String,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Runs prompt definitions and free-form questions.
pub struct Analyst {
    orchestrator: Orchestrator,
    connector: Arc<dyn ToolConnector>,
    persona: Persona,
}

impl Analyst {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        connector: Arc<dyn ToolConnector>,
        persona: Persona,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(llm, policy),
            connector,
            persona,
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Load `id` from the catalog and run it.
    pub async fn run_prompt(
        &self,
        catalog: &DirCatalog,
        id: &str,
        bindings: &Bindings,
        ctx: &RunContext,
    ) -> Result<RunOutcome, AnalysisError> {
        let definition = catalog.load(id)?;
        self.run_definition(&definition, bindings, ctx).await
    }

    /// Parse raw template text (an edited or generated prompt) and run it.
    pub async fn run_content(
        &self,
        raw: &str,
        bindings: &Bindings,
        ctx: &RunContext,
    ) -> Result<RunOutcome, AnalysisError> {
        let definition = parse_content(raw)?;
        self.run_definition(&definition, bindings, ctx).await
    }

    /// Run a parsed definition.
    ///
    /// With declared tools the bound query is sent to the endpoint first and
    /// the response becomes the analysis data. The conversation then runs
    /// with the declared tools advertised for follow-up queries.
    pub async fn run_definition(
        &self,
        definition: &PromptDefinition,
        bindings: &Bindings,
        ctx: &RunContext,
    ) -> Result<RunOutcome, AnalysisError> {
        check_bindings(definition, bindings)?;
        let query = bind_query(definition, bindings)?;

        let mut log = RunLog::default();
        log.push(
            LogEntryType::Status,
            format!("Starting analysis with prompt: {}", definition.id()),
        );
        for var in definition.variables() {
            if let Some(value) = bindings.get(&var.name) {
                log.push(LogEntryType::Status, format!("{}: {}", var.name, value));
            }
        }

        let Some(query) = query else {
            log.push(LogEntryType::Status, "LLM-only mode (no MCP query)");
            let analysis = bind_analysis(definition, bindings, None)?;
            return Ok(self.converse(ctx, &analysis, &[], None, log).await);
        };

        let adapter = self.open_session(&mut log).await;
        let listing = match &adapter {
            Some(adapter) => list_or_empty(adapter.as_ref(), &mut log).await,
            None => Vec::new(),
        };
        let resolved = resolve_tools(definition.tools(), &listing);

        let data = match (&adapter, resolved.first()) {
            (Some(adapter), Some(tool)) => {
                log.push(
                    LogEntryType::ToolCall,
                    format!("Sending query to {} ({} chars)", tool.remote_name, query.chars().count()),
                );
                let arguments = query_arguments(&tool.advertised, &query);
                let fetched = invoke_with_retry(
                    adapter.as_ref(),
                    &tool.remote_name,
                    &arguments,
                    self.orchestrator.policy(),
                    &ctx.cancel,
                    &mut log,
                )
                .await;
                match fetched {
                    Err(failure) => return Ok(finish_early(failure, log)),
                    Ok(Ok(text)) if text.trim().is_empty() => {
                        log.push(LogEntryType::Error, "MCP returned empty response");
                        NO_DATA.to_string()
                    }
                    Ok(Ok(text)) => {
                        log.push(
                            LogEntryType::ToolResult,
                            format!("Response received ({} characters)", text.chars().count()),
                        );
                        text
                    }
                    Ok(Err(e)) => {
                        log.push(LogEntryType::Error, format!("Data fetch failed: {}", e));
                        data_unavailable(&e)
                    }
                }
            }
            _ => data_unavailable(&ToolError::unreachable("no session with the device inventory")),
        };

        let analysis = bind_analysis(definition, bindings, Some(&data))?;
        Ok(self
            .converse(ctx, &analysis, &resolved, adapter.as_deref(), log)
            .await)
    }

    /// Answer a question with every endpoint tool available to the model.
    pub async fn run_freeform(
        &self,
        question: &str,
        ctx: &RunContext,
    ) -> Result<RunOutcome, AnalysisError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AnalysisError::EmptyQuestion);
        }

        let mut log = RunLog::default();
        log.push(LogEntryType::Status, format!("Free-form question: {}", question));

        let adapter = self.open_session(&mut log).await;
        let (resolved, user) = match &adapter {
            Some(adapter) => {
                let listing = list_or_empty(adapter.as_ref(), &mut log).await;
                (resolve_all(&listing), question.to_string())
            }
            None => (
                Vec::new(),
                format!(
                    "{}\n\nNote: the device inventory could not be reached, so no device \
                     data is available. Do not invent any.",
                    question
                ),
            ),
        };
        Ok(self
            .converse(ctx, &user, &resolved, adapter.as_deref(), log)
            .await)
    }

    async fn converse(
        &self,
        ctx: &RunContext,
        user: &str,
        tools: &[crate::tools::ResolvedTool],
        adapter: Option<&dyn ToolAdapter>,
        mut log: RunLog,
    ) -> RunOutcome {
        log.push(
            LogEntryType::Status,
            format!(
                "Sending prompt to {} (system {} chars, prompt {} chars)",
                ctx.model,
                self.persona.system_prompt().chars().count(),
                user.chars().count()
            ),
        );
        let outcome = self
            .orchestrator
            .run(
                &ctx.model,
                self.persona.system_prompt(),
                user,
                tools,
                adapter,
                &ctx.cancel,
                log,
            )
            .await;
        match &outcome.result {
            Ok(_) => tracing::info!(rounds = outcome.rounds, "Analysis complete"),
            Err(e) => tracing::warn!(rounds = outcome.rounds, error = %e, "Analysis failed"),
        }
        outcome
    }

    async fn open_session(&self, log: &mut RunLog) -> Option<Box<dyn ToolAdapter>> {
        log.push(LogEntryType::Status, "Connecting to MCP server...");
        match self.connector.connect().await {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                log.push(LogEntryType::Error, format!("MCP connection failed: {}", e));
                None
            }
        }
    }
}

async fn list_or_empty(adapter: &dyn ToolAdapter, log: &mut RunLog) -> Vec<ToolSpec> {
    match adapter.list_tools().await {
        Ok(tools) => {
            let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
            log.push(
                LogEntryType::Status,
                format!("{} tool(s) available: {}", tools.len(), names.join(", ")),
            );
            tools
        }
        Err(e) => {
            log.push(LogEntryType::Error, format!("Listing tools failed: {}", e));
            Vec::new()
        }
    }
}

fn data_unavailable(err: &ToolError) -> String {
    format!(
        "Data unavailable: the device inventory query failed ({}: {}). \
         Do not invent device data; report that it could not be retrieved.",
        err.kind, err.message
    )
}

fn finish_early(failure: RunFailure, mut log: RunLog) -> RunOutcome {
    log.push(LogEntryType::Error, format!("Run failed: {}", failure));
    RunOutcome {
        result: Err(failure),
        rounds: 0,
        log: log.into_entries(),
    }
}
