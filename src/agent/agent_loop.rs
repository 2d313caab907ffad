//! Core agent loop implementation.
//!
//! One run is a small state machine:
//!
//! ```text
//! Seeded -> AwaitingModel -> (ExecutingTools -> AwaitingModel)* -> Finished
//! ```
//!
//! The conversation is owned by the run and dropped when it finishes. Every
//! model call carries the same advertised tool set.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatMessage, LlmClient, ModelError, ModelErrorKind, ModelResponse, ToolCall};
use crate::tools::{ResolvedTool, ToolAdapter, ToolError, ToolSpec};

/// Limits and timing for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPolicy {
    /// Model calls allowed before the run is abandoned.
    pub max_rounds: usize,
    /// Extra attempts for a tool call that was unreachable or timed out.
    pub tool_retries: u32,
    pub model_retries: u32,
    pub retry_delay: Duration,
    pub tool_timeout: Duration,
    pub model_timeout: Duration,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            tool_retries: 1,
            model_retries: 1,
            retry_delay: Duration::from_millis(500),
            tool_timeout: Duration::from_secs(120),
            model_timeout: Duration::from_secs(600),
        }
    }
}

/// A single entry in the run execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// Timestamp (RFC 3339)
    pub timestamp: String,
    pub entry_type: LogEntryType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    Status,
    ToolCall,
    ToolResult,
    Retry,
    Response,
    Error,
}

/// Execution log shared by the pipeline steps of one run.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    entries: Vec<RunLogEntry>,
}

impl RunLog {
    pub fn push(&mut self, entry_type: LogEntryType, content: impl Into<String>) {
        let content = content.into();
        match entry_type {
            LogEntryType::Error => tracing::warn!("{}", content),
            LogEntryType::Retry => tracing::info!("{}", content),
            _ => tracing::debug!("{}", content),
        }
        self.entries.push(RunLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            entry_type,
            content,
        });
    }

    pub fn entries(&self) -> &[RunLogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<RunLogEntry> {
        self.entries
    }
}

/// Why a run ended without a report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunFailure {
    #[error("no final answer after {0} rounds")]
    IterationLimitExceeded(usize),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Terminal state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: Result<String, RunFailure>,
    /// Model calls made.
    pub rounds: usize,
    pub log: Vec<RunLogEntry>,
}

enum State {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Finished(Result<String, RunFailure>),
}

/// Drives a model through tool-calling rounds until it answers.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    policy: LoopPolicy,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, policy: LoopPolicy) -> Self {
        Self { llm, policy }
    }

    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    /// Run a conversation seeded with `system` and `user`.
    ///
    /// Only tools in `tools` are advertised and only those are forwarded to
    /// `adapter`. `log` may already hold entries from earlier pipeline steps.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        model: &str,
        system: &str,
        user: &str,
        tools: &[ResolvedTool],
        adapter: Option<&dyn ToolAdapter>,
        cancel: &CancellationToken,
        mut log: RunLog,
    ) -> RunOutcome {
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let advertised: Vec<ToolSpec> = tools.iter().map(|t| t.advertised.clone()).collect();
        let mut rounds = 0;
        let mut state = State::AwaitingModel;

        loop {
            state = match state {
                State::AwaitingModel => {
                    if cancel.is_cancelled() {
                        State::Finished(Err(RunFailure::Cancelled))
                    } else if rounds >= self.policy.max_rounds {
                        State::Finished(Err(RunFailure::IterationLimitExceeded(
                            self.policy.max_rounds,
                        )))
                    } else {
                        rounds += 1;
                        log.push(
                            LogEntryType::Status,
                            format!("Thinking... (round {}/{})", rounds, self.policy.max_rounds),
                        );
                        match self
                            .call_model(model, &messages, &advertised, cancel, &mut log)
                            .await
                        {
                            Err(failure) => State::Finished(Err(failure)),
                            Ok(mut response) if !response.tool_calls.is_empty() => {
                                for (index, call) in response.tool_calls.iter_mut().enumerate() {
                                    if call.id.is_empty() {
                                        call.id = format!("call_{}_{}", rounds - 1, index);
                                    }
                                }
                                messages.push(ChatMessage::assistant(
                                    response.content.clone(),
                                    response.tool_calls.clone(),
                                ));
                                State::ExecutingTools(response.tool_calls)
                            }
                            Ok(response) => match response.text() {
                                Some(text) => {
                                    log.push(LogEntryType::Response, truncate_for_log(text, 2000));
                                    State::Finished(Ok(text.to_string()))
                                }
                                None => State::Finished(Err(RunFailure::Model(ModelError::new(
                                    ModelErrorKind::Malformed,
                                    "model returned neither text nor tool calls",
                                )))),
                            },
                        }
                    }
                }
                State::ExecutingTools(calls) => {
                    log.push(
                        LogEntryType::Status,
                        format!("Executing {} tool call(s)...", calls.len()),
                    );
                    let mut cancelled = false;
                    for call in &calls {
                        match self.execute_call(call, tools, adapter, cancel, &mut log).await {
                            Ok(content) => {
                                messages.push(ChatMessage::tool_result(&call.id, content))
                            }
                            Err(_) => {
                                cancelled = true;
                                break;
                            }
                        }
                    }
                    if cancelled {
                        State::Finished(Err(RunFailure::Cancelled))
                    } else {
                        State::AwaitingModel
                    }
                }
                State::Finished(result) => {
                    if let Err(failure) = &result {
                        log.push(LogEntryType::Error, format!("Run failed: {}", failure));
                    }
                    return RunOutcome {
                        result,
                        rounds,
                        log: log.into_entries(),
                    };
                }
            };
        }
    }

    async fn call_model(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        cancel: &CancellationToken,
        log: &mut RunLog,
    ) -> Result<ModelResponse, RunFailure> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RunFailure::Cancelled);
            }
            let outcome = tokio::time::timeout(
                self.policy.model_timeout,
                self.llm.chat_completion(model, messages, tools),
            )
            .await;
            if cancel.is_cancelled() {
                return Err(RunFailure::Cancelled);
            }
            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => ModelError::new(
                    ModelErrorKind::Timeout,
                    format!("no response within {}s", self.policy.model_timeout.as_secs()),
                ),
            };
            if !err.is_retryable() || attempt >= self.policy.model_retries {
                return Err(RunFailure::Model(err));
            }
            attempt += 1;
            log.push(
                LogEntryType::Retry,
                format!("Model call failed ({}), retrying ({}/{})", err, attempt, self.policy.model_retries),
            );
            pause(self.policy.retry_delay, cancel).await?;
        }
    }

    /// Execute one requested call and render its outcome for the model.
    /// Only cancellation is an error here.
    async fn execute_call(
        &self,
        call: &ToolCall,
        tools: &[ResolvedTool],
        adapter: Option<&dyn ToolAdapter>,
        cancel: &CancellationToken,
        log: &mut RunLog,
    ) -> Result<String, RunFailure> {
        if cancel.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }
        let name = &call.function.name;
        let resolved = tools.iter().find(|t| &t.advertised.name == name);
        let (Some(resolved), Some(adapter)) = (resolved, adapter) else {
            log.push(
                LogEntryType::Error,
                format!("Model requested unavailable tool '{}', not forwarded", name),
            );
            return Ok(unavailable_tool_message(name, tools));
        };

        log.push(
            LogEntryType::ToolCall,
            format!("Calling tool: {} with args: {}", name, call.function.arguments),
        );
        let outcome = invoke_with_retry(
            adapter,
            &resolved.remote_name,
            &call.function.arguments,
            &self.policy,
            cancel,
            log,
        )
        .await?;

        Ok(match outcome {
            Ok(output) => {
                log.push(
                    LogEntryType::ToolResult,
                    format!("{} returned {} chars: {}", name, output.chars().count(), truncate_for_log(&output, 1000)),
                );
                output
            }
            Err(e) => {
                log.push(LogEntryType::Error, format!("{} failed: {}", name, e));
                explain_tool_failure(name, &e)
            }
        })
    }
}

/// Invoke a tool, retrying unreachable and timed-out attempts per `policy`.
///
/// The outer error is cancellation; the inner result is the tool outcome.
/// An in-flight call always runs to completion. If the run was cancelled
/// meanwhile, its result is discarded.
pub(crate) async fn invoke_with_retry(
    adapter: &dyn ToolAdapter,
    name: &str,
    arguments: &Value,
    policy: &LoopPolicy,
    cancel: &CancellationToken,
    log: &mut RunLog,
) -> Result<Result<String, ToolError>, RunFailure> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }
        let outcome = tokio::time::timeout(policy.tool_timeout, adapter.invoke(name, arguments)).await;
        if cancel.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }
        let err = match outcome {
            Ok(Ok(output)) => return Ok(Ok(output)),
            Ok(Err(e)) => e,
            Err(_) => ToolError::timeout(format!(
                "no response within {}s",
                policy.tool_timeout.as_secs()
            )),
        };
        if !err.is_retryable() || attempt >= policy.tool_retries {
            return Ok(Err(err));
        }
        attempt += 1;
        log.push(
            LogEntryType::Retry,
            format!("Tool {} failed ({}), retrying ({}/{})", name, err, attempt, policy.tool_retries),
        );
        pause(policy.retry_delay, cancel).await?;
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), RunFailure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RunFailure::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Tool result text telling the model the data could not be fetched.
pub(crate) fn explain_tool_failure(tool: &str, err: &ToolError) -> String {
    format!(
        "Error calling tool '{}' ({}): {}\n\
         The requested data is unavailable. Do not invent or estimate it; \
         state in your answer that this data could not be retrieved.",
        tool, err.kind, err.message
    )
}

fn unavailable_tool_message(name: &str, tools: &[ResolvedTool]) -> String {
    let available: Vec<&str> = tools.iter().map(|t| t.advertised.name.as_str()).collect();
    let listing = if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    };
    format!(
        "Tool '{}' is not available for this analysis and was not called. \
         Available tools: {}. Do not invent its output.",
        name, listing
    )
}

/// Truncate a string for logging purposes.
pub(crate) fn truncate_for_log(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((end, _)) => format!("{}... [truncated]", &s[..end]),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::llm::{FunctionCall, Role};

    /// Replays scripted turns and records every conversation it was shown.
    #[derive(Default)]
    struct ScriptedLlm {
        turns: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
        seen_tools: Mutex<Vec<Vec<String>>>,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        fn new(turns: Vec<Result<ModelResponse, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            tools: &[ToolSpec],
        ) -> Result<ModelResponse, ModelError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.seen_tools
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.name.clone()).collect());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(tool_turn(&["armis_query"])))
        }
    }

    /// Fails with the scripted errors first, then succeeds.
    #[derive(Default)]
    struct FakeTools {
        failures: Mutex<VecDeque<ToolError>>,
        calls: Mutex<Vec<(String, Value)>>,
        completed: Mutex<usize>,
        delay: Option<Duration>,
    }

    impl FakeTools {
        fn failing(failures: Vec<ToolError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                ..Default::default()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ToolAdapter for FakeTools {
        async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
            Ok(vec![ToolSpec::query_tool("armis_query", "Device lookup")])
        }

        async fn invoke(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            *self.completed.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok("device rows".to_string()),
            }
        }
    }

    fn text_turn(text: &str) -> ModelResponse {
        ModelResponse {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
        }
    }

    fn tool_turn(names: &[&str]) -> ModelResponse {
        ModelResponse {
            content: None,
            tool_calls: names
                .iter()
                .map(|name| ToolCall {
                    id: String::new(),
                    function: FunctionCall {
                        name: name.to_string(),
                        arguments: json!({"query": "cameras"}),
                    },
                })
                .collect(),
        }
    }

    fn armis_tool() -> Vec<ResolvedTool> {
        vec![ResolvedTool {
            advertised: ToolSpec::query_tool("armis_query", "Device lookup"),
            remote_name: "armis_query".to_string(),
        }]
    }

    fn policy() -> LoopPolicy {
        LoopPolicy {
            max_rounds: 4,
            retry_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn run(
        llm: Arc<ScriptedLlm>,
        tools: &FakeTools,
        policy: LoopPolicy,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        Orchestrator::new(llm, policy)
            .run(
                "mistral",
                "persona",
                "analyze",
                &armis_tool(),
                Some(tools as &dyn ToolAdapter),
                cancel,
                RunLog::default(),
            )
            .await
    }

    fn tool_messages(conversation: &[ChatMessage]) -> Vec<&ChatMessage> {
        conversation.iter().filter(|m| m.role == Role::Tool).collect()
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_round() {
        let llm = ScriptedLlm::new(vec![Ok(text_turn("report"))]);
        let tools = FakeTools::default();
        let outcome = run(llm.clone(), &tools, policy(), &CancellationToken::new()).await;

        assert_eq!(outcome.result, Ok("report".to_string()));
        assert_eq!(outcome.rounds, 1);
        assert_eq!(tools.call_count(), 0);

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0][0], ChatMessage::system("persona"));
        assert_eq!(seen[0][1], ChatMessage::user("analyze"));
        assert_eq!(llm.seen_tools.lock().unwrap()[0], vec!["armis_query"]);
    }

    #[tokio::test]
    async fn always_calling_tools_hits_iteration_limit() {
        let llm = ScriptedLlm::new(Vec::new());
        let tools = FakeTools::default();
        let outcome = run(llm.clone(), &tools, policy(), &CancellationToken::new()).await;

        assert_eq!(outcome.result, Err(RunFailure::IterationLimitExceeded(4)));
        assert_eq!(outcome.rounds, 4);
        assert_eq!(llm.seen.lock().unwrap().len(), 4);
        assert_eq!(tools.call_count(), 4);
    }

    #[tokio::test]
    async fn unreachable_twice_is_explained_then_answered() {
        let llm = ScriptedLlm::new(vec![
            Ok(tool_turn(&["armis_query"])),
            Ok(text_turn("data could not be retrieved")),
        ]);
        let tools = FakeTools::failing(vec![
            ToolError::unreachable("connection refused"),
            ToolError::unreachable("connection refused"),
        ]);
        let outcome = run(llm.clone(), &tools, policy(), &CancellationToken::new()).await;

        assert_eq!(outcome.result, Ok("data could not be retrieved".to_string()));
        assert_eq!(tools.call_count(), 2);
        assert!(outcome
            .log
            .iter()
            .any(|e| e.entry_type == LogEntryType::Retry));

        let seen = llm.seen.lock().unwrap();
        let results = tool_messages(&seen[1]);
        assert_eq!(results.len(), 1);
        let text = results[0].content.as_deref().unwrap();
        assert!(text.contains("unreachable"));
        assert!(text.contains("Do not invent"));
    }

    #[tokio::test]
    async fn rejected_calls_are_not_retried() {
        let llm = ScriptedLlm::new(vec![Ok(tool_turn(&["armis_query"])), Ok(text_turn("done"))]);
        let tools = FakeTools::failing(vec![ToolError::rejected("bad query")]);
        let outcome = run(llm, &tools, policy(), &CancellationToken::new()).await;

        assert_eq!(outcome.result, Ok("done".to_string()));
        assert_eq!(tools.call_count(), 1);
    }

    #[tokio::test]
    async fn unadvertised_tool_is_never_forwarded() {
        let llm = ScriptedLlm::new(vec![
            Ok(tool_turn(&["delete_devices"])),
            Ok(text_turn("cannot do that")),
        ]);
        let tools = FakeTools::default();
        let outcome = run(llm.clone(), &tools, policy(), &CancellationToken::new()).await;

        assert_eq!(outcome.result, Ok("cannot do that".to_string()));
        assert_eq!(tools.call_count(), 0);
        let seen = llm.seen.lock().unwrap();
        let text = tool_messages(&seen[1])[0].content.clone().unwrap();
        assert!(text.contains("'delete_devices' is not available"));
        assert!(text.contains("armis_query"));
    }

    #[tokio::test]
    async fn tool_results_follow_their_calls_in_order() {
        let llm = ScriptedLlm::new(vec![
            Ok(tool_turn(&["armis_query", "armis_query"])),
            Ok(text_turn("ok")),
        ]);
        let tools = FakeTools::default();
        run(llm.clone(), &tools, policy(), &CancellationToken::new()).await;

        let seen = llm.seen.lock().unwrap();
        let conversation = &seen[1];
        assert_eq!(conversation.len(), 5);
        let assistant = &conversation[2];
        assert_eq!(assistant.role, Role::Assistant);
        let ids: Vec<&str> = assistant
            .tool_calls
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["call_0_0", "call_0_1"]);
        assert_eq!(conversation[3].tool_call_id.as_deref(), Some("call_0_0"));
        assert_eq!(conversation[4].tool_call_id.as_deref(), Some("call_0_1"));
    }

    #[tokio::test]
    async fn empty_turn_is_a_model_failure() {
        let llm = ScriptedLlm::new(vec![Ok(ModelResponse::default())]);
        let outcome = run(llm, &FakeTools::default(), policy(), &CancellationToken::new()).await;
        match outcome.result {
            Err(RunFailure::Model(e)) => assert_eq!(e.kind, ModelErrorKind::Malformed),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_model_is_retried_within_budget() {
        let down = || ModelError::new(ModelErrorKind::Unreachable, "connection refused");

        let llm = ScriptedLlm::new(vec![Err(down()), Ok(text_turn("report"))]);
        let outcome = run(llm, &FakeTools::default(), policy(), &CancellationToken::new()).await;
        assert_eq!(outcome.result, Ok("report".to_string()));

        let llm = ScriptedLlm::new(vec![Err(down()), Err(down()), Ok(text_turn("late"))]);
        let outcome = run(llm, &FakeTools::default(), policy(), &CancellationToken::new()).await;
        assert_eq!(outcome.result, Err(RunFailure::Model(down())));
    }

    #[tokio::test]
    async fn slow_tool_times_out_and_is_explained() {
        let llm = ScriptedLlm::new(vec![Ok(tool_turn(&["armis_query"])), Ok(text_turn("partial"))]);
        let tools = FakeTools {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let policy = LoopPolicy {
            tool_timeout: Duration::from_millis(20),
            ..policy()
        };
        let outcome = run(llm.clone(), &tools, policy, &CancellationToken::new()).await;

        assert_eq!(outcome.result, Ok("partial".to_string()));
        assert_eq!(tools.call_count(), 2);
        let seen = llm.seen.lock().unwrap();
        assert!(tool_messages(&seen[1])[0]
            .content
            .as_deref()
            .unwrap()
            .contains("timeout"));
    }

    #[tokio::test]
    async fn slow_model_times_out_and_fails_after_retry() {
        let llm = Arc::new(ScriptedLlm {
            turns: Mutex::new(vec![Ok(text_turn("late")), Ok(text_turn("late"))].into()),
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let policy = LoopPolicy {
            model_timeout: Duration::from_millis(20),
            ..policy()
        };
        let outcome = run(llm.clone(), &FakeTools::default(), policy, &CancellationToken::new()).await;

        match outcome.result {
            Err(RunFailure::Model(e)) => assert_eq!(e.kind, ModelErrorKind::Timeout),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(llm.seen.lock().unwrap().len(), 2);
        assert!(outcome
            .log
            .iter()
            .any(|e| e.entry_type == LogEntryType::Retry));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_model_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let llm = ScriptedLlm::new(vec![Ok(text_turn("never"))]);
        let outcome = run(llm.clone(), &FakeTools::default(), policy(), &cancel).await;

        assert_eq!(outcome.result, Err(RunFailure::Cancelled));
        assert_eq!(outcome.rounds, 0);
        assert!(llm.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_lets_the_tool_call_finish_and_discards_it() {
        let cancel = CancellationToken::new();
        let llm = ScriptedLlm::new(vec![Ok(tool_turn(&["armis_query"])), Ok(text_turn("never"))]);
        let tools = FakeTools {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = run(llm.clone(), &tools, policy(), &cancel).await;

        assert_eq!(outcome.result, Err(RunFailure::Cancelled));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(*tools.completed.lock().unwrap(), 1);
        assert_eq!(llm.seen.lock().unwrap().len(), 1);
        assert!(!outcome
            .log
            .iter()
            .any(|e| e.entry_type == LogEntryType::ToolResult));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("héllo", 10), "héllo");
        assert_eq!(truncate_for_log("héllo", 2), "hé... [truncated]");
    }
}
