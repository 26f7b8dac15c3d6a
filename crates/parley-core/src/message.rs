//! Message types for conversation representation.
//!
//! A session's history is a flat, ordered list of [`Message`] values.
//! Messages are immutable once appended, with one exception: entries in
//! `tool_invocations` transition from [`ToolInvocationState::Call`] to
//! [`ToolInvocationState::Result`] exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role in the conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A request-ready attachment reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub url: String,
}

/// Lifecycle of one tool invocation inside an assistant message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolInvocationState {
    Call,
    Result,
}

/// One tool call issued by the model, and its result once available.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub state: ToolInvocationState,
    /// Round counter within one logical assistant turn. Assigned by the
    /// stream layer; strictly increases across continuation rounds.
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ToolInvocation {
    /// Transition to the result state. A resolved invocation never regresses,
    /// so resolving twice keeps the first result.
    pub fn resolve(&mut self, result: serde_json::Value) {
        if self.state == ToolInvocationState::Call {
            self.state = ToolInvocationState::Result;
            self.result = Some(result);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state == ToolInvocationState::Result
    }
}

/// A message in the conversation. Serializes with camelCase field names to
/// match the wire shape the stream layer speaks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            attachments: Vec::new(),
            tool_invocations: Vec::new(),
            annotations: None,
            data: None,
        }
    }

    /// Highest tool-invocation step in this message, if it has any.
    pub fn max_step(&self) -> Option<u32> {
        self.tool_invocations.iter().map(|inv| inv.step).max()
    }

    /// True when the message carries at least one tool invocation and every
    /// one of them has a result.
    pub fn all_tools_resolved(&self) -> bool {
        !self.tool_invocations.is_empty()
            && self.tool_invocations.iter().all(ToolInvocation::is_resolved)
    }
}

/// Input to [`crate::session::ChatSession::append`]: a message that may not
/// yet have an id or timestamp.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub annotations: Option<Vec<serde_json::Value>>,
    pub data: Option<serde_json::Value>,
}

impl Default for MessageDraft {
    fn default() -> Self {
        Self {
            id: None,
            role: Role::User,
            content: String::new(),
            attachments: Vec::new(),
            annotations: None,
            data: None,
        }
    }
}

impl MessageDraft {
    /// A user message draft, the common case.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// A system message draft.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Injectable id source; must produce values unique within a session's
/// lifetime.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub fn default_id_generator() -> IdGenerator {
    Arc::new(|| format!("msg_{}", Uuid::new_v4()))
}
