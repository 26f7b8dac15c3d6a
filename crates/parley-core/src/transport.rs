//! The stream-layer seam: the contract this crate requires from whatever
//! turns a network response into incremental message updates.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Wire protocol the stream layer should speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamProtocol {
    /// Structured data-stream protocol: message deltas plus out-of-band data.
    #[default]
    Data,
    /// Plain text chunks forming a single assistant message.
    Text,
}

/// One logical chat-completion request, ready for the transport.
///
/// Headers and body fields arrive pre-merged: session-level defaults
/// overlaid with per-call overrides, per-call taking precedence.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub endpoint: String,
    pub messages: Vec<Message>,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Map<String, Value>,
    pub data: Option<Value>,
    pub protocol: StreamProtocol,
}

/// Incremental update yielded by the stream layer.
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    /// Candidate tail of the message list.
    pub message: Message,
    /// Replace the most recent message instead of appending a new one.
    pub replace_last: bool,
    /// Out-of-band data items delivered alongside this update.
    pub data: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed stream: {0}")]
    Malformed(String),
}

pub type ChatStream = BoxStream<'static, Result<StreamUpdate, TransportError>>;

/// Stream layer that executes one chat-completion request.
///
/// Implementations must honor the cancellation token promptly: a cancelled
/// token should unwind the stream rather than block on further reads.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    async fn open(
        &self,
        request: ChatRequest,
        token: CancellationToken,
    ) -> Result<ChatStream, TransportError>;
}
