use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::errors::{AgentError, AgentResult, LoopError};
use crate::models::message::{Message, ToolRequest};
use crate::models::tool::ToolCall;
use crate::providers::base::{ModelRequest, Provider, ProviderChunk, Usage};
use crate::providers::utils::parse_tool_call;
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_STEPS: usize = 5;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the loop reports while it runs, in emission order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    /// A model call has started streaming
    StartStep { message_id: String },
    TextDelta { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallArgsDelta { id: String, delta: String },
    /// The complete call, once its arguments have finished streaming
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult { id: String, output: Value },
    ToolError { id: String, error: String },
    FinishStep { reason: String, usage: Usage },
    /// Terminal: the loop reached an answer
    Finish { reason: String, usage: Usage },
    /// Terminal: the loop failed
    Error { message: String },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Finish { .. } | AgentEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools,
    Done,
    Failed,
}

/// How a completed run went
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub state: LoopState,
    /// Tool rounds executed
    pub steps: usize,
    pub model_calls: usize,
    pub usage: Usage,
}

/// One model response, reassembled from its stream
struct ModelStep {
    message: Message,
    reason: String,
    usage: Usage,
}

struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Agent drives a model backend through rounds of tool calls until it produces an answer
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: ToolRegistry,
    model: String,
    max_steps: usize,
    tool_timeout: Duration,
}

impl Agent {
    pub fn new<S: Into<String>>(
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        model: S,
    ) -> Self {
        Self {
            provider,
            registry,
            model: model.into(),
            max_steps: DEFAULT_MAX_STEPS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Tool rounds allowed for this run. Without tools the model is asked exactly once.
    pub fn step_budget(&self) -> usize {
        if self.registry.is_empty() {
            0
        } else {
            self.max_steps
        }
    }

    /// Run the loop to completion, appending every assistant and tool message to
    /// `conversation` and sending events to `tx` as they happen.
    ///
    /// Exactly one terminal event is sent unless the receiver goes away first, in which
    /// case the run stops with [`LoopError::Disconnected`] and in-flight work is dropped.
    pub async fn run(
        &self,
        conversation: &mut Vec<Message>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<LoopOutcome, LoopError> {
        let tools = self.registry.tools().to_vec();
        let mut budget = self.step_budget();
        let mut outcome = LoopOutcome {
            state: LoopState::AwaitingModel,
            steps: 0,
            model_calls: 0,
            usage: Usage::default(),
        };

        loop {
            let request = ModelRequest::new(&self.model, conversation.clone(), tools.clone());
            outcome.model_calls += 1;

            let step = match self.model_step(&request, tx).await {
                Ok(step) => step,
                Err(LoopError::Backend(e)) => {
                    transition(&mut outcome.state, LoopState::Failed);
                    error!(model = %self.model, error = %e, "model backend call failed");
                    // Best effort, the caller may already be gone
                    let _ = tx
                        .send(AgentEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return Err(LoopError::Backend(e));
                }
                Err(e) => return Err(e),
            };
            outcome.usage = outcome.usage.add(&step.usage);

            let requests: Vec<ToolRequest> = step.message.tool_requests().cloned().collect();
            let execute = !requests.is_empty() && budget > 0;

            emit(
                tx,
                AgentEvent::FinishStep {
                    reason: step.reason.clone(),
                    usage: step.usage.clone(),
                },
            )
            .await?;
            if !step.message.is_empty() {
                conversation.push(step.message);
            }

            if !execute {
                if !requests.is_empty() {
                    debug!(calls = requests.len(), "no step budget, tool calls left unexecuted");
                }
                return self.finish(outcome, step.reason, tx).await;
            }

            transition(&mut outcome.state, LoopState::ExecutingTools);
            let responses = self.execute_tools(&requests, tx).await?;
            conversation.push(responses);
            budget -= 1;
            outcome.steps += 1;

            if budget == 0 {
                debug!(steps = outcome.steps, "step budget exhausted");
                return self.finish(outcome, step.reason, tx).await;
            }
            transition(&mut outcome.state, LoopState::AwaitingModel);
        }
    }

    async fn finish(
        &self,
        mut outcome: LoopOutcome,
        reason: String,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<LoopOutcome, LoopError> {
        transition(&mut outcome.state, LoopState::Done);
        emit(
            tx,
            AgentEvent::Finish {
                reason,
                usage: outcome.usage.clone(),
            },
        )
        .await?;
        Ok(outcome)
    }

    /// Stream one model response, forwarding its fragments as they arrive
    async fn model_step(
        &self,
        request: &ModelRequest,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<ModelStep, LoopError> {
        let mut chunks = self.provider.stream(request).await?;

        emit(
            tx,
            AgentEvent::StartStep {
                message_id: format!("msg-{}", uuid::Uuid::new_v4().simple()),
            },
        )
        .await?;

        let mut text = String::new();
        let mut calls: BTreeMap<usize, PendingCall> = BTreeMap::new();
        let mut reason = "unknown".to_string();
        let mut usage = Usage::default();

        loop {
            let chunk = tokio::select! {
                chunk = chunks.next() => chunk,
                _ = tx.closed() => return Err(LoopError::Disconnected),
            };
            let Some(chunk) = chunk else { break };

            match chunk? {
                ProviderChunk::TextDelta(delta) => {
                    text.push_str(&delta);
                    emit(tx, AgentEvent::TextDelta { text: delta }).await?;
                }
                ProviderChunk::ToolCallStart { index, id, name } => {
                    if calls.contains_key(&index) {
                        continue;
                    }
                    let id = if id.is_empty() {
                        format!("call_{}", uuid::Uuid::new_v4().simple())
                    } else {
                        id
                    };
                    emit(
                        tx,
                        AgentEvent::ToolCallStart {
                            id: id.clone(),
                            name: name.clone(),
                        },
                    )
                    .await?;
                    calls.insert(
                        index,
                        PendingCall {
                            id,
                            name,
                            arguments: String::new(),
                        },
                    );
                }
                ProviderChunk::ToolCallArgsDelta { index, delta } => {
                    let Some(call) = calls.get_mut(&index) else {
                        debug!(index, "argument fragment for unknown tool call");
                        continue;
                    };
                    call.arguments.push_str(&delta);
                    let id = call.id.clone();
                    emit(tx, AgentEvent::ToolCallArgsDelta { id, delta }).await?;
                }
                ProviderChunk::Finish { reason: finish } => reason = finish,
                ProviderChunk::Usage(reported) => usage = reported,
            }
        }

        let mut message = Message::assistant();
        if !text.is_empty() {
            message = message.with_text(text);
        }
        for call in calls.into_values() {
            let content = parse_tool_call(call.id.clone(), &call.name, &call.arguments);
            let arguments = match content.as_tool_request().map(|r| &r.tool_call) {
                Some(Ok(parsed)) => parsed.arguments.clone(),
                _ => json!({}),
            };
            emit(
                tx,
                AgentEvent::ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments,
                },
            )
            .await?;
            message = message.with_content(content);
        }

        Ok(ModelStep {
            message,
            reason,
            usage,
        })
    }

    /// Run every requested call concurrently. Results are reported as they complete and
    /// returned as one tool message in the order the model asked for them.
    async fn execute_tools(
        &self,
        requests: &[ToolRequest],
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Message, LoopError> {
        let mut pending: FuturesUnordered<_> = requests
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let call = request.tool_call.clone();
                async move { (index, self.dispatch(call).await) }
            })
            .collect();

        let mut results: Vec<Option<AgentResult<Value>>> = vec![None; requests.len()];
        loop {
            let next = tokio::select! {
                next = pending.next() => next,
                _ = tx.closed() => return Err(LoopError::Disconnected),
            };
            let Some((index, result)) = next else { break };

            let id = requests[index].id.clone();
            let event = match &result {
                Ok(output) => AgentEvent::ToolResult {
                    id,
                    output: output.clone(),
                },
                Err(e) => AgentEvent::ToolError {
                    id,
                    error: e.to_string(),
                },
            };
            emit(tx, event).await?;
            results[index] = Some(result);
        }

        let mut message = Message::tool();
        for (request, result) in requests.iter().zip(results) {
            let result = result
                .unwrap_or_else(|| Err(AgentError::Internal("tool call was not run".to_string())));
            message = message.with_tool_response(request.id.clone(), result);
        }
        Ok(message)
    }

    async fn dispatch(&self, call: AgentResult<ToolCall>) -> AgentResult<Value> {
        let call = call?;
        let executor = self
            .registry
            .get(&call.name)
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))?;

        match tokio::time::timeout(self.tool_timeout, executor(call.arguments)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.tool_timeout.as_millis() as u64)),
        }
    }
}

async fn emit(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<(), LoopError> {
    tx.send(event).await.map_err(|_| LoopError::Disconnected)
}

fn transition(state: &mut LoopState, next: LoopState) {
    let from = *state;
    debug!(from = ?from, to = ?next, "loop state");
    *state = next;
}
