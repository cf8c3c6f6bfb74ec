//! The active conversation: its message list, the context window sent to
//! the model, and reconciliation of streamed output into messages.

use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::BackendSelector;
use crate::error::{AssistError, Result};
use crate::models::{
    Attachment, Conversation, ConversationUpdate, Message, MessageStatus, PerformanceMetrics, Role,
};
use crate::prompts::PromptProfile;
use crate::storage::ConversationStore;

const DEFAULT_TITLE: &str = "New Conversation";
const TITLE_CHARS: usize = 40;
const STOPPED_TEXT: &str = "Generation stopped";
const EMPTY_REPLY_TEXT: &str = "The model returned an empty reply.";

/// Changes to the session, in the order they happened. The UI renders from these.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The message list was replaced wholesale.
    Reset { conversation_id: Uuid, messages: Vec<Message> },
    MessageAppended(Message),
    /// Streamed text arrived for the pending assistant message.
    MessageUpdated { message_id: Uuid, delta: String, content: String },
    MessageFinalized(Message),
    /// The pending assistant message ended in an error, now shown as its text.
    MessageFailed(Message),
    /// A send was refused before anything was recorded.
    Rejected(String),
    TitleChanged { conversation_id: Uuid, title: String },
    Loading(bool),
}

enum StreamOutcome {
    Completed,
    Failed(AssistError),
    Stopped,
}

/// Cancels in-flight generations from outside the sending task.
#[derive(Clone)]
pub struct StopHandle {
    inflight: Arc<DashMap<Uuid, CancellationToken>>,
}

impl StopHandle {
    /// Returns false if the message is not generating.
    pub fn stop(&self, message_id: Uuid) -> bool {
        match self.inflight.get(&message_id) {
            Some(token) => {
                log::info!("Stop requested for message {}", message_id);
                token.cancel();
                true
            }
            None => {
                log::debug!("Stop requested for message {} which is not generating", message_id);
                false
            }
        }
    }

    pub fn stop_all(&self) {
        for entry in self.inflight.iter() {
            entry.value().cancel();
        }
    }
}

pub struct ConversationSession {
    store: Arc<dyn ConversationStore>,
    conversation: Option<Conversation>,
    messages: Vec<Message>,
    default_profile: PromptProfile,
    window: usize,
    loading: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    inflight: Arc<DashMap<Uuid, CancellationToken>>,
}

impl ConversationSession {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        default_profile: PromptProfile,
        window: usize,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let session = Self {
            store,
            conversation: None,
            messages: Vec::new(),
            default_profile,
            window,
            loading: false,
            events,
            inflight: Arc::new(DashMap::new()),
        };
        (session, receiver)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { inflight: self.inflight.clone() }
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn profile(&self) -> PromptProfile {
        self.conversation.as_ref().map(|c| c.profile).unwrap_or(self.default_profile)
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine; the session state is still authoritative.
        let _ = self.events.send(event);
    }

    fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
        self.emit(SessionEvent::Loading(loading));
    }

    /// Loads an existing conversation, or creates a new one when `conversation_id`
    /// is `None`. Either way the previous message list is discarded first.
    pub async fn start(&mut self, conversation_id: Option<Uuid>) -> Result<Uuid> {
        self.stop_handle().stop_all();
        self.conversation = None;
        self.messages.clear();

        let (conversation, messages) = match conversation_id {
            Some(id) => {
                let conversation = self
                    .store
                    .get_conversation(id)
                    .await
                    .map_err(AssistError::storage)?
                    .ok_or_else(|| AssistError::InvalidRequest(format!("Conversation {} does not exist", id)))?;
                let messages = self.store.list_messages(id).await.map_err(AssistError::storage)?;
                (conversation, messages)
            }
            None => {
                let conversation = self
                    .store
                    .create_conversation(DEFAULT_TITLE, self.default_profile)
                    .await
                    .map_err(AssistError::storage)?;
                (conversation, Vec::new())
            }
        };

        let id = conversation.id;
        log::info!("Session started on conversation {} ({} messages)", id, messages.len());
        self.conversation = Some(conversation);
        self.messages = messages;
        self.emit(SessionEvent::Reset { conversation_id: id, messages: self.messages.clone() });
        Ok(id)
    }

    /// Changes the workflow kind for this conversation and later turns.
    pub async fn set_profile(&mut self, profile: PromptProfile) -> Result<()> {
        self.default_profile = profile;
        if let Some(conversation) = self.conversation.as_mut() {
            self.store
                .update_conversation_metadata(
                    conversation.id,
                    ConversationUpdate { profile: Some(profile), ..Default::default() },
                )
                .await
                .map_err(AssistError::storage)?;
            conversation.profile = profile;
        }
        Ok(())
    }

    /// System prompt, then the last `window` prior turns with text, then the
    /// new user turn and an open assistant cue.
    pub fn build_context(&self, new_user_text: &str) -> String {
        let mut context = String::new();
        context.push_str(self.profile().system_prompt());
        context.push_str("\n\n");

        let prior: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Complete && !m.content.trim().is_empty())
            .collect();
        let skip = prior.len().saturating_sub(self.window);
        for message in &prior[skip..] {
            let label = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            context.push_str(label);
            context.push_str(": ");
            context.push_str(message.content.trim());
            context.push('\n');
        }

        context.push_str("User: ");
        context.push_str(new_user_text.trim());
        context.push_str("\nAssistant:");
        context
    }

    async fn ensure_conversation(&mut self) -> Result<Uuid> {
        match &self.conversation {
            Some(conversation) => Ok(conversation.id),
            None => self.start(None).await,
        }
    }

    /// Sends one user turn and waits for the assistant's reply to settle.
    ///
    /// Returns `Err` only when the send is refused up front (nothing is
    /// appended) or storage fails. Transport and decode failures end up as an
    /// errored assistant message, returned as `Ok`.
    pub async fn send(
        &mut self,
        selector: &BackendSelector,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        if let Err(e) = selector.admit(text, &attachments) {
            log::warn!("Send rejected: {}", e);
            self.emit(SessionEvent::Rejected(e.to_string()));
            return Err(e);
        }
        let conversation_id = match self.ensure_conversation().await {
            Ok(id) => id,
            Err(e) => {
                self.emit(SessionEvent::Rejected(e.to_string()));
                return Err(e);
            }
        };

        let profile = self.profile();
        let context = self.build_context(text);
        let backend = selector.mode();
        let media = attachments.iter().map(|a| a.media.clone()).collect();
        let is_first_turn = !self.messages.iter().any(|m| m.role == Role::User);

        let user_message = Message::user(conversation_id, text.trim(), backend, media);
        self.store
            .append_message(conversation_id, &user_message)
            .await
            .map_err(AssistError::storage)?;
        self.messages.push(user_message.clone());
        self.emit(SessionEvent::MessageAppended(user_message));

        if is_first_turn {
            self.title_from(conversation_id, text).await;
        }

        let placeholder = Message::placeholder(conversation_id, backend);
        let message_id = placeholder.id;
        let cancel = CancellationToken::new();
        self.inflight.insert(message_id, cancel.clone());
        self.messages.push(placeholder.clone());
        let index = self.messages.len() - 1;
        self.emit(SessionEvent::MessageAppended(placeholder));
        self.set_loading(true);

        log::info!("Generating reply {} on {} backend ({} context chars)", message_id, backend, context.len());
        let started = Instant::now();
        let mut tokens = selector.stream(&context, profile, &attachments);
        let mut received: u64 = 0;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamOutcome::Stopped,
                next = tokens.next() => next,
            };
            let Some(token) = next else {
                break StreamOutcome::Failed(AssistError::Transport("stream ended unexpectedly".to_string()));
            };
            if !token.text.is_empty() {
                received += 1;
                let message = &mut self.messages[index];
                message.content.push_str(&token.text);
                let content = message.content.clone();
                self.emit(SessionEvent::MessageUpdated { message_id, delta: token.text, content });
            }
            if token.is_complete {
                break match token.error {
                    Some(e) => StreamOutcome::Failed(e),
                    None => StreamOutcome::Completed,
                };
            }
        };
        // Dropping the stream closes the connection if it is still open.
        drop(tokens);
        self.inflight.remove(&message_id);

        let elapsed = started.elapsed();
        let metrics = PerformanceMetrics {
            latency_ms: Some(elapsed.as_millis() as u64),
            tokens_per_second: (elapsed.as_secs_f64() > 0.0 && received > 0)
                .then(|| received as f64 / elapsed.as_secs_f64()),
            model_info: selector.model_info(),
        };

        let finished = match outcome {
            StreamOutcome::Completed if self.messages[index].content.trim().is_empty() => {
                log::warn!("Reply {} completed without any text", message_id);
                Ok(self.fail(index, EMPTY_REPLY_TEXT.to_string()))
            }
            StreamOutcome::Completed => self.finalize(index, metrics).await,
            StreamOutcome::Stopped if !self.messages[index].content.is_empty() => {
                log::info!("Reply {} stopped; keeping {} chars", message_id, self.messages[index].content.len());
                self.finalize(index, metrics).await
            }
            StreamOutcome::Stopped => Ok(self.fail(index, STOPPED_TEXT.to_string())),
            StreamOutcome::Failed(e) => {
                log::error!("Reply {} failed: {}", message_id, e);
                Ok(self.fail(index, e.to_string()))
            }
        };
        self.set_loading(false);
        finished
    }

    // Writes the assistant message exactly once.
    async fn finalize(&mut self, index: usize, metrics: PerformanceMetrics) -> Result<Message> {
        let message = &mut self.messages[index];
        message.status = MessageStatus::Complete;
        message.metadata = Some(metrics);
        let message = message.clone();

        self.store
            .append_message(message.conversation_id, &message)
            .await
            .map_err(AssistError::storage)?;
        log::info!("Reply {} finalized ({} chars)", message.id, message.content.len());
        self.emit(SessionEvent::MessageFinalized(message.clone()));
        Ok(message)
    }

    // Partial text is replaced by the error; errored turns are not persisted.
    fn fail(&mut self, index: usize, reason: String) -> Message {
        let message = &mut self.messages[index];
        message.status = MessageStatus::Errored;
        message.content = reason;
        let message = message.clone();
        self.emit(SessionEvent::MessageFailed(message.clone()));
        message
    }

    async fn title_from(&mut self, conversation_id: Uuid, text: &str) {
        let title: String = text.trim().chars().take(TITLE_CHARS).collect();
        if title.is_empty() {
            return;
        }
        let update = ConversationUpdate { title: Some(title.clone()), ..Default::default() };
        if let Err(e) = self.store.update_conversation_metadata(conversation_id, update).await {
            log::warn!("Could not set conversation title: {:#}", e);
            return;
        }
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.title = title.clone();
        }
        self.emit(SessionEvent::TitleChanged { conversation_id, title });
    }
}
