//! Session controller: one conversation's observable state and the
//! auto-continuation state machine.
//!
//! A [`ChatSession`] owns a session's reactive surface (message list, input
//! buffer, out-of-band data, loading and error flags) and drives requests
//! through the executor. The message list itself lives in the shared
//! [`SessionCache`]; the controller keeps a local mirror for synchronous
//! reads and subscribes to the cache so writes from other controllers bound
//! to the same key are observed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{SessionCache, SessionKey};
use crate::error::{Error, Result, SessionError};
use crate::executor::{RequestExecutor, RequestOutcome};
use crate::message::{
    Attachment, IdGenerator, Message, MessageDraft, Role, ToolInvocation, default_id_generator,
};
use crate::transport::{ChatRequest, ChatTransport, StreamProtocol};

/// Fired once after the transport stream opens.
pub type ResponseHandler = Arc<dyn Fn() + Send + Sync>;
/// Fired with the final assistant message when a stream completes.
pub type FinishHandler = Arc<dyn Fn(&Message) + Send + Sync>;
/// Fired with every request failure, alongside the reactive error field.
pub type ErrorHandler = Arc<dyn Fn(&SessionError) + Send + Sync>;
/// Fired for each new tool call observed in the stream. Returning `Some`
/// fills the invocation's result immediately (client-executed tools).
pub type ToolCallHandler = Arc<dyn Fn(&ToolInvocation) -> Option<Value> + Send + Sync>;
/// Resolves raw attachments into request-ready form.
pub type AttachmentResolver = Arc<dyn Fn(Vec<Attachment>) -> Vec<Attachment> + Send + Sync>;

/// Lifecycle callbacks, all optional.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_response: Option<ResponseHandler>,
    pub on_finish: Option<FinishHandler>,
    pub on_tool_call: Option<ToolCallHandler>,
    pub on_error: Option<ErrorHandler>,
}

/// Configuration for one chat session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Endpoint identifier; together with the session id it derives the
    /// cache key.
    pub endpoint: String,
    /// Fixed session id. Generated once at construction when absent.
    pub session_id: Option<String>,
    /// Seed history, used only when the cache has no entry for the key.
    pub initial_messages: Vec<Message>,
    pub initial_input: String,
    /// Session-level header defaults, overridden per call.
    pub headers: HashMap<String, String>,
    /// Session-level body defaults, overridden per call.
    pub body: serde_json::Map<String, Value>,
    pub id_generator: IdGenerator,
    pub attachment_resolver: AttachmentResolver,
    pub protocol: StreamProtocol,
    /// Bound on automatic tool-call round trips. Must be >= 1.
    pub max_steps: u32,
    /// Keep the partially streamed message on failure instead of rolling
    /// back to the pre-request snapshot.
    pub keep_last_message_on_error: bool,
    pub callbacks: SessionCallbacks,
}

impl SessionOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_id: None,
            initial_messages: Vec::new(),
            initial_input: String::new(),
            headers: HashMap::new(),
            body: serde_json::Map::new(),
            id_generator: default_id_generator(),
            attachment_resolver: Arc::new(|attachments| attachments),
            protocol: StreamProtocol::default(),
            max_steps: 1,
            keep_last_message_on_error: true,
            callbacks: SessionCallbacks::default(),
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_initial_messages(mut self, messages: Vec<Message>) -> Self {
        self.initial_messages = messages;
        self
    }

    pub fn with_initial_input(mut self, input: impl Into<String>) -> Self {
        self.initial_input = input.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.body.insert(name.into(), value);
        self
    }

    pub fn with_id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn with_attachment_resolver(mut self, resolver: AttachmentResolver) -> Self {
        self.attachment_resolver = resolver;
        self
    }

    pub fn with_protocol(mut self, protocol: StreamProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_keep_last_message_on_error(mut self, keep: bool) -> Self {
        self.keep_last_message_on_error = keep;
        self
    }

    pub fn with_callbacks(mut self, callbacks: SessionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Per-call overrides, merged over the session defaults (per-call wins).
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub body: serde_json::Map<String, Value>,
    pub data: Option<Value>,
}

struct AbortHandle {
    generation: u64,
    token: CancellationToken,
}

struct Shared {
    mirror: Mutex<Vec<Message>>,
    stream_data: Mutex<Vec<Value>>,
    input: Mutex<String>,
    abort_handle: Mutex<Option<AbortHandle>>,
    request_seq: AtomicU64,
    loading_tx: watch::Sender<bool>,
    error_tx: watch::Sender<Option<SessionError>>,
}

/// One conversational session's controller.
pub struct ChatSession {
    id: String,
    key: SessionKey,
    cache: Arc<SessionCache>,
    executor: RequestExecutor,
    options: SessionOptions,
    shared: Arc<Shared>,
    unsubscribe: CancellationToken,
}

impl ChatSession {
    /// Build a controller bound to `(endpoint, session id)`.
    ///
    /// Seeds the cache from `initial_messages` when the key is absent, then
    /// subscribes to the key so writes from any controller sharing it are
    /// mirrored locally. Requires a running tokio runtime.
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        cache: Arc<SessionCache>,
        options: SessionOptions,
    ) -> Result<Self> {
        if options.max_steps == 0 {
            return Err(Error::Configuration("max_steps must be >= 1".to_string()));
        }

        let id = options
            .session_id
            .clone()
            .unwrap_or_else(|| (options.id_generator)());
        let key = SessionKey::new(&options.endpoint, &id);

        let messages = match cache.get(&key) {
            Some(messages) => messages,
            None => {
                cache.set(&key, options.initial_messages.clone());
                options.initial_messages.clone()
            }
        };

        let (loading_tx, _) = watch::channel(false);
        let (error_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            mirror: Mutex::new(messages),
            stream_data: Mutex::new(Vec::new()),
            input: Mutex::new(options.initial_input.clone()),
            abort_handle: Mutex::new(None),
            request_seq: AtomicU64::new(0),
            loading_tx,
            error_tx,
        });

        // One-way observation effect: cache writes flow into the mirror
        // until the controller is dropped.
        let unsubscribe = CancellationToken::new();
        let mut updates = cache.subscribe(&key);
        {
            let shared = Arc::clone(&shared);
            let stop = unsubscribe.clone();
            let key = key.clone();
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        () = stop.cancelled() => break,
                        next = updates.recv() => match next {
                            Ok(messages) => *shared.mirror.lock().unwrap() = messages,
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(session_key = %key, lagged = n, "session mirror lagged behind cache updates");
                                // Dropped updates may include the final
                                // write; resync from the source of truth.
                                if let Some(messages) = cache.get(&key) {
                                    *shared.mirror.lock().unwrap() = messages;
                                }
                            }
                        },
                    }
                }
            });
        }

        Ok(Self {
            id,
            key,
            cache,
            executor: RequestExecutor::new(transport),
            options,
            shared,
            unsubscribe,
        })
    }

    /// Session identifier, fixed at construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cache key this session reads and writes.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Current message list, read through the cache.
    pub fn messages(&self) -> Vec<Message> {
        self.cache
            .get(&self.key)
            .unwrap_or_else(|| self.shared.mirror.lock().unwrap().clone())
    }

    /// Subscribe to message-list changes, including those made by other
    /// controllers bound to the same key.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Vec<Message>> {
        self.cache.subscribe(&self.key)
    }

    pub fn is_loading(&self) -> bool {
        *self.shared.loading_tx.borrow()
    }

    pub fn loading_watch(&self) -> watch::Receiver<bool> {
        self.shared.loading_tx.subscribe()
    }

    pub fn error(&self) -> Option<SessionError> {
        self.shared.error_tx.borrow().clone()
    }

    pub fn error_watch(&self) -> watch::Receiver<Option<SessionError>> {
        self.shared.error_tx.subscribe()
    }

    pub fn input(&self) -> String {
        self.shared.input.lock().unwrap().clone()
    }

    pub fn set_input(&self, input: impl Into<String>) {
        *self.shared.input.lock().unwrap() = input.into();
    }

    /// Out-of-band data accumulated across the session.
    pub fn data(&self) -> Vec<Value> {
        self.shared.stream_data.lock().unwrap().clone()
    }

    /// Replace the out-of-band data sequence. Purely local.
    pub fn set_data(&self, data: Vec<Value>) {
        *self.shared.stream_data.lock().unwrap() = data;
    }

    /// Update the out-of-band data sequence with a pure function of the
    /// current value. Purely local.
    pub fn update_data(&self, update: impl FnOnce(&[Value]) -> Vec<Value>) {
        let mut guard = self.shared.stream_data.lock().unwrap();
        let next = update(&guard);
        *guard = next;
    }

    /// Replace the message list: writes through to the cache and updates the
    /// local mirror synchronously. No network call.
    pub fn set_messages(&self, messages: Vec<Message>) {
        self.publish(messages);
    }

    /// Update the message list with a pure function of the current list.
    pub fn update_messages(&self, update: impl FnOnce(&[Message]) -> Vec<Message>) {
        let next = update(&self.messages());
        self.publish(next);
    }

    /// Append a message and trigger a request with the extended history.
    ///
    /// Assigns an id when the draft has none, resolves attachments, and
    /// resolves to the final assistant message id. Failures never propagate
    /// as `Err`; they surface on the reactive error field, and the return
    /// value is `None` on any non-success path.
    pub async fn append(&self, draft: MessageDraft, options: RequestOptions) -> Option<String> {
        let message = self.materialize(draft);
        let mut candidate = self.messages();
        candidate.push(message);
        self.trigger_request(candidate, &options).await
    }

    /// Regenerate the last assistant turn.
    ///
    /// Drops one trailing assistant message when present and re-triggers a
    /// request with the remaining history. No-op on an empty history.
    pub async fn reload(&self, options: RequestOptions) -> Option<String> {
        let mut candidate = self.messages();
        if candidate.is_empty() {
            return None;
        }
        if candidate.last().map(|message| message.role) == Some(Role::Assistant) {
            candidate.pop();
        }
        self.trigger_request(candidate, &options).await
    }

    /// Abort the active request, if any. Idempotent.
    pub fn stop(&self) {
        let handle = self.shared.abort_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            debug!(session_key = %self.key, "stopping in-flight request");
            handle.token.cancel();
        }
    }

    /// Provide the result for a tool call in the last message.
    ///
    /// Only the last message is inspected; an id that matches an earlier
    /// message leaves the list unchanged. When every invocation in the last
    /// message has a result and the step bound allows it, a continuation
    /// request is triggered with the updated history.
    pub async fn add_tool_result(&self, tool_call_id: &str, result: Value) {
        let mut messages = self.messages();
        let mut continue_run = false;

        if let Some(last) = messages.last_mut()
            && last.role == Role::Assistant
            && !last.tool_invocations.is_empty()
        {
            for inv in &mut last.tool_invocations {
                if inv.tool_call_id == tool_call_id {
                    inv.resolve(result.clone());
                }
            }
            continue_run = last.all_tools_resolved()
                && last.max_step().is_some_and(|step| step < self.options.max_steps);
        }

        self.publish(messages.clone());

        if continue_run {
            debug!(session_key = %self.key, tool_call_id, "all tool calls resolved, continuing");
            let _ = self
                .trigger_request(messages, &RequestOptions::default())
                .await;
        }
    }

    fn materialize(&self, draft: MessageDraft) -> Message {
        let id = draft
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| (self.options.id_generator)());
        let attachments = if draft.attachments.is_empty() {
            Vec::new()
        } else {
            (self.options.attachment_resolver)(draft.attachments)
        };
        Message {
            id,
            role: draft.role,
            content: draft.content,
            created_at: chrono::Utc::now(),
            attachments,
            tool_invocations: Vec::new(),
            annotations: draft.annotations,
            data: draft.data,
        }
    }

    /// Write a new message list: mirror first (synchronous reads), then the
    /// cache (fan-out). The subscription task will deliver the same value
    /// back to the mirror, which is harmless.
    fn publish(&self, messages: Vec<Message>) {
        *self.shared.mirror.lock().unwrap() = messages.clone();
        self.cache.set(&self.key, messages);
    }

    fn build_request(&self, messages: Vec<Message>, options: &RequestOptions) -> ChatRequest {
        let mut headers = self.options.headers.clone();
        headers.extend(options.headers.clone());
        let mut body = self.options.body.clone();
        body.extend(options.body.clone());
        ChatRequest {
            endpoint: self.options.endpoint.clone(),
            messages,
            headers,
            body,
            data: options.data.clone(),
            protocol: self.options.protocol,
        }
    }

    /// Install a fresh cancellation handle, superseding (and cancelling) any
    /// request still in flight.
    fn install_abort_handle(&self) -> (u64, CancellationToken) {
        let generation = self.shared.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = self.shared.abort_handle.lock().unwrap().replace(AbortHandle {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            debug!(session_key = %self.key, "superseding in-flight request");
            previous.token.cancel();
        }
        (generation, token)
    }

    /// Clear the abort handle if this request still owns it. Returns whether
    /// this request is allowed to finalize the loading flag: true unless it
    /// was superseded by a newer request.
    fn finish_request(&self, generation: u64) -> bool {
        let mut slot = self.shared.abort_handle.lock().unwrap();
        match slot.as_ref() {
            Some(handle) if handle.generation == generation => {
                *slot = None;
                true
            }
            // A newer request owns the session now.
            Some(_) => false,
            // stop() already cleared the handle.
            None => true,
        }
    }

    /// The auto-continuation state machine: runs the executor with the
    /// candidate list, then keeps re-triggering while the last assistant
    /// turn consists solely of resolved tool calls and the step bound holds.
    async fn trigger_request(
        &self,
        mut candidate: Vec<Message>,
        options: &RequestOptions,
    ) -> Option<String> {
        let max_steps = self.options.max_steps;
        loop {
            let snapshot = self.messages();
            let message_count_before = snapshot.len();
            let step_before = candidate.last().and_then(Message::max_step);

            self.shared.error_tx.send_replace(None);
            self.shared.loading_tx.send_replace(true);
            let (generation, token) = self.install_abort_handle();

            // Superseded requests must not clobber a newer request's state:
            // publishing is gated on still owning the abort handle.
            let publish = |messages: Vec<Message>| {
                let current = {
                    let slot = self.shared.abort_handle.lock().unwrap();
                    slot.as_ref()
                        .is_some_and(|handle| handle.generation == generation)
                };
                if current {
                    self.publish(messages);
                }
            };
            let push_data = |items: Vec<Value>| {
                self.shared.stream_data.lock().unwrap().extend(items);
            };

            let request = self.build_request(candidate.clone(), options);
            debug!(
                session_key = %self.key,
                messages = request.messages.len(),
                "issuing chat request"
            );
            let outcome = self
                .executor
                .execute(
                    request,
                    snapshot,
                    &self.options.callbacks,
                    self.options.keep_last_message_on_error,
                    token,
                    publish,
                    push_data,
                )
                .await;

            // Finalization guarantee: loading clears on every exit path,
            // unless a newer request already owns the flag.
            if self.finish_request(generation) {
                self.shared.loading_tx.send_replace(false);
            }

            let messages = match outcome {
                RequestOutcome::Aborted(_) => return None,
                RequestOutcome::Failed(err) => {
                    warn!(session_key = %self.key, error = %err, "chat request failed");
                    if let Some(on_error) = &self.options.callbacks.on_error {
                        on_error(&err);
                    }
                    self.shared.error_tx.send_replace(Some(err));
                    return None;
                }
                RequestOutcome::Completed(messages) => messages,
            };

            if should_auto_continue(&messages, message_count_before, step_before, max_steps) {
                debug!(session_key = %self.key, "auto-continuing after resolved tool calls");
                candidate = messages;
                continue;
            }

            return messages
                .last()
                .filter(|message| message.role == Role::Assistant)
                .map(|message| message.id.clone());
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.unsubscribe.cancel();
    }
}

/// Whether a completed request should trigger another round.
///
/// Requires progress (the list grew or the step counter advanced), a step
/// budget above one, and a last assistant message that issued only tool
/// calls (no text) which all have results and sit below the step bound.
fn should_auto_continue(
    messages: &[Message],
    message_count_before: usize,
    step_before: Option<u32>,
    max_steps: u32,
) -> bool {
    let Some(last) = messages.last() else {
        return false;
    };
    let max_step = last.max_step();
    let progressed =
        messages.len() > message_count_before || (max_step.is_some() && max_step > step_before);
    progressed
        && max_steps > 1
        && last.role == Role::Assistant
        && last.all_tools_resolved()
        && last.content.is_empty()
        && max_step.is_some_and(|step| step < max_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ToolInvocation, ToolInvocationState};
    use rstest::rstest;
    use serde_json::json;

    fn assistant_with_calls(content: &str, invocations: Vec<(u32, bool)>) -> Message {
        let mut message = Message::new("a1", Role::Assistant, content);
        message.tool_invocations = invocations
            .into_iter()
            .enumerate()
            .map(|(i, (step, resolved))| ToolInvocation {
                tool_call_id: format!("call-{i}"),
                tool_name: "lookup".to_string(),
                args: json!({}),
                state: if resolved {
                    ToolInvocationState::Result
                } else {
                    ToolInvocationState::Call
                },
                step,
                result: resolved.then(|| json!("ok")),
            })
            .collect();
        message
    }

    #[rstest]
    // Empty history never continues.
    #[case(vec![], 0, None, 3, false)]
    // Resolved tool calls, empty content, step below the bound.
    #[case(vec![Message::new("u1", Role::User, "hi"), assistant_with_calls("", vec![(1, true)])], 1, None, 3, true)]
    // Step bound of one disables continuation entirely.
    #[case(vec![assistant_with_calls("", vec![(1, true)])], 0, None, 1, false)]
    // Unresolved invocation blocks continuation.
    #[case(vec![assistant_with_calls("", vec![(1, true), (1, false)])], 0, None, 3, false)]
    // Non-empty content means the model produced a final answer.
    #[case(vec![assistant_with_calls("done", vec![(1, true)])], 0, None, 3, false)]
    // Step at the bound stops the loop.
    #[case(vec![assistant_with_calls("", vec![(3, true)])], 0, Some(2), 3, false)]
    // No growth and no step advance: a stalled round must not loop.
    #[case(vec![assistant_with_calls("", vec![(1, true)])], 1, Some(1), 3, false)]
    // Step advance alone counts as progress even without growth.
    #[case(vec![assistant_with_calls("", vec![(2, true)])], 1, Some(1), 3, true)]
    // A last message without tool invocations settles.
    #[case(vec![Message::new("a2", Role::Assistant, "")], 0, None, 3, false)]
    // A trailing user message settles.
    #[case(vec![Message::new("u1", Role::User, "hi")], 0, None, 3, false)]
    fn auto_continue_predicate(
        #[case] messages: Vec<Message>,
        #[case] count_before: usize,
        #[case] step_before: Option<u32>,
        #[case] max_steps: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(
            should_auto_continue(&messages, count_before, step_before, max_steps),
            expected
        );
    }
}
