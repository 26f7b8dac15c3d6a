//! Streaming request executor: runs one logical chat-completion request.
//!
//! The executor optimistically publishes the outgoing message list, applies
//! incremental stream updates to a mutable draft, and reports an explicit
//! [`RequestOutcome`]. It never decides *what* to send; that is the
//! controller's job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::message::{Message, Role, ToolInvocationState};
use crate::session::SessionCallbacks;
use crate::transport::{ChatRequest, ChatTransport};

/// Terminal outcome of one streaming request.
///
/// An explicit variant rather than error inspection: cancellation is a clean
/// outcome, not a failure.
#[derive(Debug)]
pub enum RequestOutcome {
    /// The stream ran to completion; carries the final message list.
    Completed(Vec<Message>),
    /// The request was cancelled. Content streamed so far is kept.
    Aborted(Vec<Message>),
    /// Transport or protocol failure. The session list was restored to its
    /// pre-request snapshot unless configured to keep the partial message.
    Failed(SessionError),
}

pub struct RequestExecutor {
    transport: Arc<dyn ChatTransport>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    /// Run one request against the transport.
    ///
    /// `publish` installs a new message list as the session's current state;
    /// it is called once up front with `request.messages` (the optimistic
    /// update) and again after every stream update. `push_data` appends
    /// out-of-band items to the session's accumulated data sequence.
    /// `snapshot` is the pre-request state restored on failure when
    /// `keep_last_message_on_error` is off.
    pub async fn execute<P, D>(
        &self,
        request: ChatRequest,
        snapshot: Vec<Message>,
        callbacks: &SessionCallbacks,
        keep_last_message_on_error: bool,
        token: CancellationToken,
        publish: P,
        push_data: D,
    ) -> RequestOutcome
    where
        P: Fn(Vec<Message>),
        D: Fn(Vec<Value>),
    {
        let mut draft = request.messages.clone();
        publish(draft.clone());

        // Invocation ids already present in the outgoing list must not
        // re-fire the on_tool_call callback on continuation rounds.
        let mut seen_calls: HashSet<String> = draft
            .iter()
            .flat_map(|message| &message.tool_invocations)
            .map(|inv| inv.tool_call_id.clone())
            .collect();
        // Results already produced (client-side or prior rounds), keyed by
        // invocation id. An invocation never regresses from result to call,
        // so these are merged back into any re-sent snapshot.
        let mut known_results: HashMap<String, Value> = draft
            .iter()
            .flat_map(|message| &message.tool_invocations)
            .filter_map(|inv| Some((inv.tool_call_id.clone(), inv.result.clone()?)))
            .collect();

        let mut stream = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!("request aborted before the stream opened");
                return RequestOutcome::Aborted(draft);
            }
            opened = self.transport.open(request, token.clone()) => match opened {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "transport failed to open stream");
                    if !keep_last_message_on_error {
                        publish(snapshot);
                    }
                    return RequestOutcome::Failed(err.into());
                }
            }
        };

        if let Some(on_response) = &callbacks.on_response {
            on_response();
        }

        loop {
            let item = tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!("request aborted mid-stream, keeping streamed content");
                    return RequestOutcome::Aborted(draft);
                }
                item = stream.next() => item,
            };

            let update = match item {
                None => break,
                Some(Ok(update)) => update,
                Some(Err(err)) => {
                    warn!(error = %err, "stream failed mid-request");
                    if !keep_last_message_on_error {
                        publish(snapshot);
                    }
                    return RequestOutcome::Failed(err.into());
                }
            };

            let mut message = update.message;
            for inv in &mut message.tool_invocations {
                let newly_seen = seen_calls.insert(inv.tool_call_id.clone());
                if newly_seen
                    && inv.state == ToolInvocationState::Call
                    && let Some(on_tool_call) = &callbacks.on_tool_call
                    && let Some(result) = on_tool_call(inv)
                {
                    inv.resolve(result);
                }
                // The transport may re-send a message it has already
                // streamed; restore results it does not know about.
                if inv.state == ToolInvocationState::Call
                    && let Some(result) = known_results.get(&inv.tool_call_id)
                {
                    inv.resolve(result.clone());
                }
                if let Some(result) = &inv.result {
                    known_results.insert(inv.tool_call_id.clone(), result.clone());
                }
            }

            if update.replace_last && !draft.is_empty() {
                let last = draft.len() - 1;
                draft[last] = message;
            } else {
                draft.push(message);
            }

            if !update.data.is_empty() {
                push_data(update.data);
            }
            publish(draft.clone());
        }

        if let Some(last) = draft.last()
            && last.role == Role::Assistant
            && let Some(on_finish) = &callbacks.on_finish
        {
            on_finish(last);
        }
        RequestOutcome::Completed(draft)
    }
}
