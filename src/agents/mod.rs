//! Agent listeners — LLM-backed capabilities.
//!
//! An agent handler is the language-model call assembly: it reads the
//! thread's conversation history from the path registry, builds the prompt,
//! calls the pool, and hands the model's XML back to the pump. The model
//! speaks payloads directly: emitted elements route by root tag (tool
//! calls, self-iteration); wrapping output in `<reply>` finishes the turn
//! and routes the content back to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult, ValidatedPayload,
};
use crate::llm::types::Message;
use crate::llm::{LlmError, LlmPool};
use crate::schema::Envelope;
use crate::threads::PathRegistry;
use crate::xml::{canon, repair};

/// Tag an agent uses to close its turn.
pub const REPLY_TAG: &str = "reply";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Model alias; `None` uses the pool default.
    pub model: Option<String>,
    pub system_prompt: String,
    pub max_tokens: u32,
}

impl AgentConfig {
    pub fn new(name: &str, system_prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            model: None,
            system_prompt: system_prompt.to_string(),
            max_tokens: 4096,
        }
    }
}

pub struct AgentHandler {
    pool: Arc<Mutex<LlmPool>>,
    config: AgentConfig,
    paths: Arc<Mutex<PathRegistry>>,
}

impl AgentHandler {
    pub fn new(
        pool: Arc<Mutex<LlmPool>>,
        paths: Arc<Mutex<PathRegistry>>,
        config: AgentConfig,
    ) -> Self {
        Self {
            pool,
            config,
            paths,
        }
    }
}

/// Build the conversation from the thread's envelope log. Envelopes the
/// agent itself emitted become assistant turns; everything else is user
/// input. Consecutive same-role entries are merged.
pub fn assemble_messages(history: &[Vec<u8>], own_name: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    for raw in history {
        let Some(envelope) = repair::parse(raw).and_then(|t| Envelope::parse(&t).ok()) else {
            continue;
        };
        let role = if envelope.from == own_name {
            "assistant"
        } else {
            "user"
        };
        let content = String::from_utf8_lossy(&envelope.canonical_bytes()).into_owned();

        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push('\n');
                last.content.push_str(&content);
            }
            _ => messages.push(Message::text(role, &content)),
        }
    }

    // The API wants the conversation to open with user input.
    if messages.first().map(|m| m.role == "assistant").unwrap_or(false) {
        messages.insert(0, Message::text("user", "(conversation resumes)"));
    }
    messages
}

/// Interpret model output: a single `<reply>` element closes the turn,
/// anything else re-enters the bus as emitted payloads.
pub fn interpret_output(text: &str) -> HandlerResponse {
    let fragments = repair::parse_fragments(text.as_bytes());
    if let [only] = fragments.as_slice() {
        if only.name == REPLY_TAG {
            let inner: Vec<u8> = only
                .elements()
                .flat_map(|child| canon::to_bytes(child))
                .collect();
            if !inner.is_empty() {
                return HandlerResponse::Reply(inner);
            }
            // Text-only reply: wrap so it stays a payload.
            let wrapped = crate::xml::Element::new("agent-response").with_text(only.text().trim());
            return HandlerResponse::Reply(canon::to_bytes(&wrapped));
        }
    }
    HandlerResponse::Emit(text.as_bytes().to_vec())
}

#[async_trait]
impl Handler for AgentHandler {
    async fn handle(&self, _payload: ValidatedPayload, ctx: HandlerContext) -> HandlerResult {
        // The dispatched envelope is already the last history entry.
        let history = self.paths.lock().await.history(&ctx.thread_id);
        let messages = assemble_messages(&history, &ctx.own_name);
        if messages.is_empty() {
            return Err(HandlerFailure::Failed(
                "no conversation history for thread".into(),
            ));
        }

        debug!(
            agent = %self.config.name,
            thread = %ctx.thread_id,
            turns = messages.len(),
            "calling model"
        );
        let response = {
            let pool = self.pool.lock().await;
            pool.complete(
                self.config.model.as_deref(),
                messages,
                self.config.max_tokens,
                Some(&self.config.system_prompt),
            )
            .await
        };

        match response {
            Ok(resp) => Ok(interpret_output(&resp.text())),
            Err(LlmError::RateLimited { retry_after }) => {
                Err(HandlerFailure::Throttled { retry_after })
            }
            Err(e) => Err(HandlerFailure::Failed(format!("backend: {e}"))),
        }
    }
}
