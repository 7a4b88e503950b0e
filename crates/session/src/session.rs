//! The chat session controller.
//!
//! A `ChatSession` turns one prompt into one persisted turn:
//!
//! 1. **Resolve** the target chat (promote the temporary chat, or refresh
//!    the summary of an existing one)
//! 2. **Prepare**: reset the chat's trace, mark it loading, create the
//!    placeholder message
//! 3. **Augment** the prompt with knowledge from the chat's collections
//! 4. **Stream** the model call, appending deltas to the placeholder
//! 5. **Finalize** the message exactly once, record usage, clear loading
//!
//! Every asynchronous step works on a `Turn` captured at submission, so a
//! turn keeps writing to its own chat after the user navigates elsewhere.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use colloquy_config::AppConfig;
use colloquy_core::chat::{ChatId, ChatUpdate, NewChat, summarize};
use colloquy_core::error::{InvocationError, PersistenceError, RetrievalError};
use colloquy_core::event::{DomainEvent, EventBus};
use colloquy_core::invocation::{ChatMessage, ChatResult, ChatService, StreamEvent};
use colloquy_core::knowledge::KnowledgeService;
use colloquy_core::message::{Message, MessageId, MessageQuery, MessageUpdate, NewMessage};
use colloquy_core::presentation::{Notifier, ScrollMetrics, Viewport};
use colloquy_core::store::ChatStore;
use colloquy_core::usage::{TelemetryEvent, TelemetrySink, UsageRecord, UsageSink};
use colloquy_telemetry::{Inspector, Span, SpanKind};
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::augment::{Augmentation, augment};
use crate::citation;
use crate::coalesce::{Action, CoalescePolicy, Coalescer};
use crate::content::{normal_content, reasoning_content};
use crate::error::SessionError;
use crate::scroll::ScrollController;
use crate::state::{ChatState, Folder, StateBoard, TurnPhase, ViewState};
use crate::token::{HeuristicCounter, TokenCounter};

/// Capacity of the per-turn stream event channel.
const EVENT_BUFFER: usize = 64;

/// The collaborators a session drives.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ChatStore>,
    pub chat: Arc<dyn ChatService>,
    pub knowledge: Arc<dyn KnowledgeService>,
    pub usage: Arc<dyn UsageSink>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub notifier: Arc<dyn Notifier>,
    pub viewport: Arc<dyn Viewport>,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The model call failed; the message keeps any partial output
    Failed(String),
    /// Cancelled by the user
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub status: TurnStatus,
    /// Whether reply, tokens and citations were persisted
    pub produced_output: bool,
}

/// Identity of an in-flight turn, captured at submission.
#[derive(Debug, Clone)]
struct Turn {
    chat_id: ChatId,
    message_id: MessageId,
    prompt: String,
    model: String,
    /// Cancelled by `abort`; owned by this turn alone
    cancel: CancellationToken,
}

/// Deltas received so far.
#[derive(Default)]
struct Streamed {
    content: String,
    reasoning: String,
}

enum Terminal {
    Complete(ChatResult),
    Failed { message: String, aborted: bool },
}

fn non_blank(text: String) -> Option<String> {
    (!text.trim().is_empty()).then_some(text)
}

pub struct ChatSessionBuilder {
    services: Services,
    config: AppConfig,
    counter: Arc<dyn TokenCounter>,
    inspector: Arc<Inspector>,
    events: Arc<EventBus>,
}

impl ChatSessionBuilder {
    /// Token counter used when the model does not report usage.
    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<Inspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> ChatSession {
        let scroll = ScrollController::new(&self.config.scroll, self.services.viewport.clone());
        let fetch_policy = CoalescePolicy::new(self.config.messages.fetch_wait())
            .with_max_wait(self.config.messages.fetch_max_wait());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let action: Action = Arc::new(move || -> BoxFuture<'static, ()> {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.load_messages().await;
                    }
                })
            });
            Inner {
                services: self.services,
                summary_max_chars: self.config.chat.summary_max_chars,
                counter: self.counter,
                inspector: self.inspector,
                events: self.events,
                board: Mutex::new(StateBoard::default()),
                view: Mutex::new(ViewState::default()),
                scroll,
                fetch: Coalescer::new("fetch_messages", fetch_policy, action),
            }
        });
        ChatSession { inner }
    }
}

/// The chat controller. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

struct Inner {
    services: Services,
    summary_max_chars: usize,
    counter: Arc<dyn TokenCounter>,
    inspector: Arc<Inspector>,
    events: Arc<EventBus>,
    board: Mutex<StateBoard>,
    view: Mutex<ViewState>,
    scroll: ScrollController,
    fetch: Coalescer,
}

impl ChatSession {
    pub fn builder(services: Services, config: &AppConfig) -> ChatSessionBuilder {
        ChatSessionBuilder {
            services,
            config: config.clone(),
            counter: Arc::new(HeuristicCounter),
            inspector: Arc::new(Inspector::new()),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.inner.events.subscribe()
    }

    pub fn inspector(&self) -> &Arc<Inspector> {
        &self.inner.inspector
    }

    pub fn active_chat(&self) -> ChatId {
        self.inner.view().active_chat.clone()
    }

    pub fn chat_state(&self, chat_id: &ChatId) -> ChatState {
        self.inner.board().get(chat_id)
    }

    /// Messages of the active chat as currently displayed.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.view().messages.clone()
    }

    pub fn keyword(&self, chat_id: &ChatId) -> String {
        self.inner.view().keyword(chat_id)
    }

    pub fn open_folders(&self) -> Vec<String> {
        let mut folders: Vec<String> = self.inner.view().open_folders.iter().cloned().collect();
        folders.sort();
        folders
    }

    /// Select the sidebar folder new chats are created in.
    pub fn select_folder(&self, folder: Option<Folder>) {
        self.inner.view().folder = folder;
    }

    /// A raw scroll event from the message viewport.
    pub fn on_scroll(&self, metrics: ScrollMetrics) {
        self.inner.scroll.on_scroll(metrics);
    }

    /// Whether streamed content currently pulls the view to the bottom.
    pub fn is_following(&self) -> bool {
        !self.inner.scroll.is_scrolling_away()
    }

    /// Switch the view to a chat and load its messages.
    ///
    /// With an anchor, the view reveals that message once loaded instead of
    /// following the bottom.
    pub async fn open_chat(&self, chat_id: ChatId, anchor: Option<String>) -> Result<(), SessionError> {
        let inner = &self.inner;
        if !chat_id.is_temporary() && inner.services.store.get_chat(&chat_id).await?.is_none() {
            return Err(PersistenceError::ChatNotFound(chat_id.to_string()).into());
        }

        let (previous, folder) = {
            let mut view = inner.view();
            let previous = std::mem::replace(&mut view.active_chat, chat_id.clone());
            view.messages.clear();
            view.anchor = anchor;
            (previous, view.folder.clone())
        };
        inner.scroll.reset();
        inner.publish(DomainEvent::ChatActivated {
            chat_id: chat_id.clone(),
            timestamp: Utc::now(),
        });

        if chat_id.is_temporary() && inner.services.chat.is_ready() {
            if let Some(folder) = folder {
                inner
                    .services
                    .knowledge
                    .set_chat_collections(&chat_id, &folder.collection_ids)
                    .await?;
                debug!(folder = %folder.id, "Temporary chat seeded from folder");
            }
        }

        debug!(from = %previous, to = %chat_id, "Chat opened");
        inner.fetch.trigger();
        Ok(())
    }

    /// Filter a chat's messages by keyword. Empty clears the filter.
    pub fn set_keyword(&self, chat_id: &ChatId, keyword: impl Into<String>) {
        let is_active = {
            let mut view = self.inner.view();
            view.keywords.insert(chat_id.clone(), keyword.into());
            view.is_active(chat_id)
        };
        if is_active {
            self.inner.fetch.trigger();
        }
    }

    /// Cancel the turn running in a chat. Returns whether one was running.
    ///
    /// Turns in other chats keep running. A turn aborted before its model
    /// call never makes the call.
    pub fn abort(&self, chat_id: &ChatId) -> bool {
        let mut board = self.inner.board();
        let phase = board.get(chat_id).phase;
        if !board.cancel(chat_id) {
            return false;
        }
        info!(chat_id = %chat_id, ?phase, "Aborting turn");
        true
    }

    /// Submit a prompt to the active chat.
    ///
    /// Returns `Ok(None)` for a blank prompt. A chat accepts one turn at a
    /// time; a second submit while a turn is running is rejected.
    pub async fn submit(&self, prompt: &str) -> Result<Option<TurnOutcome>, SessionError> {
        if prompt.trim().is_empty() {
            debug!("Ignoring blank prompt");
            return Ok(None);
        }
        let inner = &self.inner;
        if !inner.services.chat.is_ready() {
            return Err(SessionError::ServiceNotReady);
        }

        let mut chat_id = inner.view().active_chat.clone();
        let cancel = inner.board().begin(&chat_id)?;

        let turn = match inner.prepare_turn(prompt, &mut chat_id, cancel).await {
            Ok(turn) => turn,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Turn setup failed");
                inner.finish_chat(&chat_id);
                return Err(e);
            }
        };

        let augmentation = match inner.augment(&turn).await {
            Ok(augmentation) => augmentation,
            Err(e) => {
                inner.fail_retrieval(&turn, &e).await;
                return Err(e.into());
            }
        };

        let outcome = inner.stream(&turn, &augmentation).await;
        inner.ingest_telemetry(&turn.model);
        outcome.map(Some)
    }
}

impl Inner {
    fn view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn board(&self) -> MutexGuard<'_, StateBoard> {
        self.board.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: DomainEvent) {
        self.events.publish(event);
    }

    fn publish_state(&self, chat_id: &ChatId, state: ChatState) {
        self.publish(DomainEvent::ChatStateChanged {
            chat_id: chat_id.clone(),
            loading: state.loading,
            running_tool: state.running_tool,
        });
    }

    /// End a turn's claim on its chat. Runs once per accepted submit.
    fn finish_chat(&self, chat_id: &ChatId) {
        let state = self.board().finish(chat_id);
        self.publish_state(chat_id, state);
    }

    /// Steps 1–4: resolve the chat, reset its trace, mark it loading and
    /// create the placeholder message. `chat_id` follows a promotion so the
    /// caller can release the right chat on failure.
    async fn prepare_turn(
        &self,
        prompt: &str,
        chat_id: &mut ChatId,
        cancel: CancellationToken,
    ) -> Result<Turn, SessionError> {
        let summary = summarize(prompt, self.summary_max_chars);

        if chat_id.is_temporary() {
            let temp = chat_id.clone();
            let folder = self.view().folder.clone();
            let chat = self
                .services
                .store
                .create_chat(NewChat {
                    summary,
                    folder_id: folder.as_ref().map(|f| f.id.clone()),
                })
                .await?;
            self.board().transfer(&temp, &chat.id);
            *chat_id = chat.id.clone();

            let moved = self
                .services
                .knowledge
                .move_chat_collections(&temp, &chat.id)
                .await?;

            {
                let mut view = self.view();
                if view.is_active(&temp) {
                    view.active_chat = chat.id.clone();
                }
                if let Some(folder) = &folder {
                    view.open_folders.insert(folder.id.clone());
                }
                view.keywords.remove(&temp);
            }
            self.publish(DomainEvent::ChatActivated {
                chat_id: chat.id.clone(),
                timestamp: Utc::now(),
            });
            info!(
                chat_id = %chat.id,
                collections = moved.len(),
                "Temporary chat promoted"
            );
        } else {
            self.services
                .store
                .update_chat(ChatUpdate::summary(chat_id.clone(), summary))
                .await?;
            let (had_keyword, is_active) = {
                let mut view = self.view();
                let had_keyword = view
                    .keywords
                    .remove(chat_id)
                    .is_some_and(|k| !k.is_empty());
                (had_keyword, view.is_active(chat_id))
            };
            if had_keyword && is_active {
                self.fetch.trigger();
            }
        }

        self.inspector.clear_trace(chat_id.as_str());
        let state = self.board().set_loading(chat_id, true);
        self.publish_state(chat_id, state);

        let context = self.services.chat.context();
        let message = self
            .services
            .store
            .create_message(NewMessage {
                chat_id: chat_id.clone(),
                prompt: prompt.to_string(),
                reply: String::new(),
                model: context.model.clone(),
                temperature: context.temperature,
                max_tokens: context.max_tokens,
                is_active: true,
            })
            .await?;

        let visible = {
            let mut view = self.view();
            let visible = view.is_active(chat_id);
            if visible && !view.messages.iter().any(|m| m.id == message.id) {
                view.messages.push(message.clone());
            }
            visible
        };
        self.publish(DomainEvent::TurnStarted {
            chat_id: chat_id.clone(),
            message_id: message.id.clone(),
            model: context.model.clone(),
            timestamp: Utc::now(),
        });
        if visible {
            self.scroll.content_arrived();
        }
        info!(
            chat_id = %chat_id,
            message_id = %message.id,
            model = %context.model,
            "Turn started"
        );

        Ok(Turn {
            chat_id: chat_id.clone(),
            message_id: message.id,
            prompt: prompt.to_string(),
            model: context.model,
            cancel,
        })
    }

    /// Step 5: augment with the chat's knowledge collections, if any.
    async fn augment(&self, turn: &Turn) -> Result<Augmentation, RetrievalError> {
        let collections = self
            .services
            .knowledge
            .list_chat_collections(&turn.chat_id)
            .await?;
        if collections.is_empty() {
            return Ok(Augmentation::passthrough(&turn.prompt));
        }

        let ids: Vec<String> = collections.into_iter().map(|c| c.id).collect();
        let mut span = Span::new(SpanKind::Retrieval, format!("{} collections", ids.len()));
        let result = augment(self.services.knowledge.as_ref(), &turn.prompt, &ids).await;
        if let Ok(augmentation) = &result {
            span = span.with_metadata("chunks", augmentation.chunks.len());
        }
        span.end(result.is_ok());
        self.inspector.record_span(turn.chat_id.as_str(), span);
        result
    }

    /// Retrieval failed: surface it once and finalize the empty placeholder.
    async fn fail_retrieval(&self, turn: &Turn, error: &RetrievalError) {
        warn!(chat_id = %turn.chat_id, error = %error, "Knowledge retrieval failed");
        self.services.notifier.notify_error(&error.to_string());

        let update = MessageUpdate::deactivate(turn.message_id.clone());
        if let Err(e) = self.services.store.update_message(update.clone()).await {
            warn!(message_id = %turn.message_id, error = %e, "Failed to deactivate message");
        }
        self.apply_to_view(&update);
        self.publish(DomainEvent::TurnFinalized {
            chat_id: turn.chat_id.clone(),
            message_id: turn.message_id.clone(),
            produced_output: false,
            timestamp: Utc::now(),
        });
        self.finish_chat(&turn.chat_id);
    }

    /// Steps 6–7: run the model call, apply its events, finalize.
    async fn stream(&self, turn: &Turn, augmentation: &Augmentation) -> Result<TurnOutcome, SessionError> {
        self.board().set_phase(&turn.chat_id, TurnPhase::Streaming);
        let mut span = Span::new(SpanKind::LlmCall, turn.model.clone());

        // The receiver exists before the call starts, so no event is missed
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let call = async {
            if turn.cancel.is_cancelled() {
                debug!(chat_id = %turn.chat_id, "Turn aborted before the model call");
                drop(tx);
                return Err(InvocationError::Aborted);
            }
            let messages = vec![ChatMessage::user(augmentation.prompt.clone())];
            self.services
                .chat
                .chat(messages, tx, turn.cancel.clone())
                .await
        };
        let consume = async {
            let mut streamed = Streamed::default();
            let mut terminal = None;
            while let Some(event) = rx.recv().await {
                trace!(chat_id = %turn.chat_id, event = event.event_type(), "Stream event");
                if terminal.is_some() {
                    debug!(chat_id = %turn.chat_id, "Ignoring event after terminal event");
                    continue;
                }
                match event {
                    StreamEvent::Reading { content, reasoning } => {
                        streamed.content.push_str(&content);
                        streamed.reasoning.push_str(&reasoning);
                        self.on_reading(turn, content, reasoning);
                    }
                    StreamEvent::ToolCalls { name } => self.on_tool_call(turn, name),
                    StreamEvent::Complete(result) => terminal = Some(Terminal::Complete(result)),
                    StreamEvent::Error { message, aborted } => {
                        terminal = Some(Terminal::Failed { message, aborted })
                    }
                }
            }
            (streamed, terminal)
        };
        let (call_result, (streamed, terminal)) = tokio::join!(call, consume);

        if let Err(e) = &call_result {
            debug!(chat_id = %turn.chat_id, error = %e, "Chat call returned an error");
        }
        let terminal = terminal.unwrap_or_else(|| match &call_result {
            Ok(()) => Terminal::Complete(ChatResult::default()),
            Err(e) => Terminal::Failed {
                message: e.to_string(),
                aborted: e.is_aborted(),
            },
        });

        let (result, status) = match terminal {
            Terminal::Complete(mut result) => {
                if result.content.is_empty() {
                    result.content = streamed.content;
                }
                if result.reasoning.as_deref().is_none_or(|r| r.is_empty()) {
                    result.reasoning = non_blank(streamed.reasoning);
                }
                let status = match &result.error {
                    Some(error) => {
                        warn!(chat_id = %turn.chat_id, error = %error, "Turn completed with error");
                        self.services.notifier.notify_error(error);
                        TurnStatus::Failed(error.clone())
                    }
                    None => TurnStatus::Completed,
                };
                (result, status)
            }
            Terminal::Failed { message, aborted } => {
                if aborted {
                    info!(chat_id = %turn.chat_id, "Turn aborted");
                } else {
                    warn!(chat_id = %turn.chat_id, error = %message, "Turn failed");
                    self.services.notifier.notify_error(&message);
                }
                let result = ChatResult {
                    content: streamed.content,
                    reasoning: non_blank(streamed.reasoning),
                    error: Some(message.clone()),
                    ..ChatResult::default()
                };
                let status = if aborted {
                    TurnStatus::Aborted
                } else {
                    TurnStatus::Failed(message)
                };
                (result, status)
            }
        };

        let finalized = self.finalize(turn, augmentation, &result).await;
        self.finish_chat(&turn.chat_id);

        if let Ok(Some((input, output))) = &finalized {
            span.record_tokens(*input, *output);
        }
        span.end(status == TurnStatus::Completed);
        self.inspector.record_span(turn.chat_id.as_str(), span);

        let produced_output = finalized?.is_some();
        Ok(TurnOutcome {
            chat_id: turn.chat_id.clone(),
            message_id: turn.message_id.clone(),
            status,
            produced_output,
        })
    }

    fn on_reading(&self, turn: &Turn, content: String, reasoning: String) {
        let visible = {
            let mut view = self.view();
            if let Some(message) = view.messages.iter_mut().find(|m| m.id == turn.message_id) {
                message.append(&content, &reasoning);
            }
            view.is_active(&turn.chat_id)
        };
        self.publish(DomainEvent::ReplyAppended {
            chat_id: turn.chat_id.clone(),
            message_id: turn.message_id.clone(),
            content,
            reasoning,
        });
        if visible {
            self.scroll.content_arrived();
        }
    }

    fn on_tool_call(&self, turn: &Turn, name: String) {
        debug!(chat_id = %turn.chat_id, tool = %name, "Tool running");
        let state = self.board().set_running_tool(&turn.chat_id, Some(name.clone()));
        self.publish(DomainEvent::ToolRunning {
            chat_id: turn.chat_id.clone(),
            tool_name: name,
        });
        self.publish_state(&turn.chat_id, state);
    }

    /// Persist the final state of the turn's message. Returns the token
    /// counts when output was persisted.
    async fn finalize(
        &self,
        turn: &Turn,
        augmentation: &Augmentation,
        result: &ChatResult,
    ) -> Result<Option<(u32, u32)>, SessionError> {
        if result.is_empty_failure() {
            let update = MessageUpdate::deactivate(turn.message_id.clone());
            self.services.store.update_message(update.clone()).await?;
            self.apply_to_view(&update);
            self.publish(DomainEvent::TurnFinalized {
                chat_id: turn.chat_id.clone(),
                message_id: turn.message_id.clone(),
                produced_output: false,
                timestamp: Utc::now(),
            });
            info!(chat_id = %turn.chat_id, message_id = %turn.message_id, "Turn finalized without output");
            return Ok(None);
        }

        let input_tokens = result
            .input_tokens
            .filter(|&n| n > 0)
            .unwrap_or_else(|| self.counter.count_input(&turn.prompt));
        let output_tokens = result
            .output_tokens
            .filter(|&n| n > 0)
            .unwrap_or_else(|| self.counter.count_output(&result.content));
        let citations = citation::resolve(&result.content, &augmentation.chunks, &augmentation.files);

        let update = MessageUpdate {
            id: Some(turn.message_id.clone()),
            reply: Some(normal_content(&result.content)),
            reasoning: reasoning_content(&result.content, result.reasoning.as_deref()),
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            is_active: Some(false),
            cited_files: Some(citations.cited_files),
            cited_chunks: Some(citations.cited_chunks),
        };
        self.services.store.update_message(update.clone()).await?;
        self.apply_to_view(&update);

        let record = UsageRecord::new(
            self.services.chat.provider_name(),
            turn.model.clone(),
            input_tokens,
            output_tokens,
        );
        if let Err(e) = self.services.usage.create(record).await {
            warn!(chat_id = %turn.chat_id, error = %e, "Failed to record usage");
        }

        self.publish(DomainEvent::TurnFinalized {
            chat_id: turn.chat_id.clone(),
            message_id: turn.message_id.clone(),
            produced_output: true,
            timestamp: Utc::now(),
        });
        info!(
            chat_id = %turn.chat_id,
            message_id = %turn.message_id,
            input_tokens,
            output_tokens,
            "Turn finalized"
        );
        Ok(Some((input_tokens, output_tokens)))
    }

    fn apply_to_view(&self, update: &MessageUpdate) {
        let mut view = self.view();
        if let Some(message) = view
            .messages
            .iter_mut()
            .find(|m| update.id.as_ref() == Some(&m.id))
        {
            update.apply_to(message);
        }
    }

    /// Step 8: best-effort analytics.
    fn ingest_telemetry(&self, model: &str) {
        let events = vec![
            TelemetryEvent::new("app", "chat"),
            TelemetryEvent::new("model", model),
        ];
        if let Err(e) = self.services.telemetry.ingest_event(events) {
            debug!(error = %e, "Telemetry event dropped");
        }
    }

    /// Load the active chat's messages. Runs through the fetch coalescer.
    async fn load_messages(&self) {
        let (chat_id, keyword) = {
            let view = self.view();
            (view.active_chat.clone(), view.keyword(&view.active_chat))
        };
        let loaded = self
            .services
            .store
            .fetch_messages(MessageQuery::new(chat_id.clone(), keyword.clone()))
            .await;
        let mut loaded = match loaded {
            Ok(messages) => messages,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "Failed to load messages");
                self.publish(DomainEvent::MessagesLoadFailed {
                    chat_id,
                    error: e.to_string(),
                });
                return;
            }
        };

        let (count, anchor) = {
            let mut view = self.view();
            if !view.is_active(&chat_id) {
                debug!(chat_id = %chat_id, "Discarding messages of a chat no longer shown");
                return;
            }
            // Streaming messages keep the deltas already applied in view
            for message in loaded.iter_mut().filter(|m| m.is_active) {
                if let Some(live) = view.messages.iter().find(|v| v.id == message.id) {
                    *message = live.clone();
                }
            }
            // A fetch that started before a turn's placeholder existed must
            // not drop it
            let streaming: Vec<Message> = view
                .messages
                .iter()
                .filter(|v| v.is_active && v.chat_id == chat_id)
                .filter(|v| !loaded.iter().any(|m| m.id == v.id))
                .cloned()
                .collect();
            loaded.extend(streaming);
            view.messages = loaded;
            (view.messages.len(), view.anchor.take())
        };

        debug!(chat_id = %chat_id, keyword = %keyword, count, "Messages loaded");
        self.publish(DomainEvent::MessagesLoaded {
            chat_id: chat_id.clone(),
            count,
        });
        match anchor {
            Some(anchor) => self.services.viewport.scroll_to_anchor(&anchor),
            None => {
                self.scroll.content_arrived();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use colloquy_core::error::InvocationError;
    use colloquy_core::knowledge::{KnowledgeChunk, KnowledgeCollection, KnowledgeFile};
    use colloquy_telemetry::SpanKind;
    use std::sync::Arc;
    use tokio::sync::Notify;

    const LONG_PROMPT: &str =
        "Hello world, this is a very long prompt exceeding fifty characters for sure";

    async fn wait_for<F>(rx: &mut broadcast::Receiver<Arc<DomainEvent>>, mut pred: F) -> Arc<DomainEvent>
    where
        F: FnMut(&DomainEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    async fn only_message(h: &Harness) -> Message {
        let chats = h.store.chats().await;
        assert_eq!(chats.len(), 1);
        let messages = h
            .store
            .fetch_messages(MessageQuery::new(chats[0].id.clone(), ""))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        messages.into_iter().next().unwrap()
    }

    fn fruit_knowledge(h: &Harness) {
        h.knowledge.add_collection(KnowledgeCollection {
            id: "k1".into(),
            name: "Fruit".into(),
        });
        h.knowledge.add_file(
            "k1",
            KnowledgeFile {
                id: "f1".into(),
                name: "Fruit Encyclopedia".into(),
            },
            vec![
                KnowledgeChunk {
                    id: "A".into(),
                    file_id: "f1".into(),
                    content: "apples are one of common fruit".into(),
                },
                KnowledgeChunk {
                    id: "B".into(),
                    file_id: "f1".into(),
                    content: "apples grow on trees".into(),
                },
            ],
        );
        h.knowledge.attach(&ChatId::temporary(), "k1");
    }

    #[tokio::test]
    async fn blank_prompt_is_ignored() {
        let h = harness(ScriptedChatService::new());
        assert!(h.session.submit("   \n").await.unwrap().is_none());
        assert!(h.store.chats().await.is_empty());
        assert!(h.chat.prompts().is_empty());
    }

    #[tokio::test]
    async fn not_ready_service_is_rejected() {
        let service = ScriptedChatService::new();
        service.set_ready(false);
        let h = harness(service);
        assert!(matches!(
            h.session.submit("hi").await,
            Err(SessionError::ServiceNotReady)
        ));
    }

    #[tokio::test]
    async fn temporary_chat_is_promoted() {
        let h = harness(ScriptedChatService::new().with_script(vec![complete("Hi!")]));
        h.knowledge.add_collection(KnowledgeCollection {
            id: "k1".into(),
            name: "Notes".into(),
        });
        h.knowledge.attach(&ChatId::temporary(), "k1");
        h.session.select_folder(Some(Folder {
            id: "work".into(),
            name: "Work".into(),
            collection_ids: vec![],
        }));

        let outcome = h.session.submit(LONG_PROMPT).await.unwrap().unwrap();

        let chats = h.store.chats().await;
        assert_eq!(chats.len(), 1);
        let chat = &chats[0];
        assert_eq!(chat.summary.chars().count(), 50);
        assert!(LONG_PROMPT.starts_with(&chat.summary));
        assert_eq!(chat.folder_id.as_deref(), Some("work"));
        assert_eq!(outcome.chat_id, chat.id);

        assert_eq!(h.session.active_chat(), chat.id);
        assert_eq!(h.session.open_folders(), vec!["work".to_string()]);
        let temp = h.knowledge.list_chat_collections(&ChatId::temporary()).await.unwrap();
        let moved = h.knowledge.list_chat_collections(&chat.id).await.unwrap();
        assert!(temp.is_empty());
        assert_eq!(moved.len(), 1);
    }

    #[tokio::test]
    async fn existing_chat_gets_new_summary_and_cleared_keyword() {
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![complete("one")])
                .with_script(vec![complete("two")]),
        );
        let first = h.session.submit("first question").await.unwrap().unwrap();
        h.session.set_keyword(&first.chat_id, "question");

        h.session.submit("second question").await.unwrap().unwrap();

        let chat = h.store.get_chat(&first.chat_id).await.unwrap().unwrap();
        assert_eq!(chat.summary, "second question");
        assert_eq!(h.session.keyword(&first.chat_id), "");
        assert_eq!(h.store.chats().await.len(), 1);
    }

    #[tokio::test]
    async fn successful_turn_is_finalized() {
        let h = harness(ScriptedChatService::new().with_script(vec![
            reading("Hel", ""),
            reading("lo", "thinking"),
            Step::Emit(StreamEvent::Complete(ChatResult {
                content: "Hello".into(),
                reasoning: Some("thinking".into()),
                input_tokens: Some(12),
                output_tokens: Some(3),
                error: None,
            })),
        ]));
        let mut rx = h.session.subscribe();

        let outcome = h.session.submit("greet me").await.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert!(outcome.produced_output);

        let message = only_message(&h).await;
        assert_eq!(message.reply, "Hello");
        assert_eq!(message.reasoning.as_deref(), Some("thinking"));
        assert_eq!(message.input_tokens, Some(12));
        assert_eq!(message.output_tokens, Some(3));
        assert!(!message.is_active);
        assert_eq!(message.model, "mock-model");

        let state = h.session.chat_state(&outcome.chat_id);
        assert!(!state.loading);
        assert_eq!(state.phase, TurnPhase::Idle);

        let usage = h.ledger.records();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].provider, "scripted");
        assert_eq!(usage[0].input_tokens, 12);

        assert_eq!(h.telemetry.batches().len(), 1);
        assert_eq!(h.telemetry.batches()[0][1].value, "mock-model");
        assert!(h.notifier.errors().is_empty());

        let trace = h.session.inspector().trace(outcome.chat_id.as_str()).unwrap();
        assert_eq!(trace.count(&SpanKind::LlmCall), 1);

        // Deltas were published in delivery order
        let mut appended = String::new();
        while let Ok(event) = rx.try_recv() {
            if let DomainEvent::ReplyAppended { content, .. } = event.as_ref() {
                appended.push_str(content);
            }
        }
        assert_eq!(appended, "Hello");
    }

    #[tokio::test]
    async fn view_message_receives_deltas() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedChatService::new().with_script(vec![
            reading("Hel", ""),
            reading("lo", ""),
            Step::Pause(gate.clone()),
            complete("Hello"),
        ]));
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("hi").await });
        wait_for(&mut rx, |e| {
            matches!(e, DomainEvent::ReplyAppended { content, .. } if content == "lo")
        })
        .await;

        let shown = h.session.messages();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].reply, "Hello");
        assert!(shown[0].is_active);
        assert!(h.session.chat_state(&shown[0].chat_id).loading);

        gate.notify_one();
        handle.await.unwrap().unwrap();
        assert!(!h.session.messages()[0].is_active);
    }

    #[tokio::test]
    async fn failure_without_output_only_deactivates() {
        let h = harness(ScriptedChatService::new().with_script(vec![Step::Emit(
            StreamEvent::Complete(ChatResult {
                error: Some("model overloaded".into()),
                ..ChatResult::default()
            }),
        )]));

        let outcome = h.session.submit("hi").await.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed("model overloaded".into()));
        assert!(!outcome.produced_output);

        let message = only_message(&h).await;
        assert!(message.reply.is_empty());
        assert!(!message.is_active);
        assert!(message.input_tokens.is_none());
        assert!(message.output_tokens.is_none());
        assert!(message.cited_chunks.is_empty());
        assert!(h.ledger.is_empty());
        assert_eq!(h.notifier.errors(), vec!["model overloaded".to_string()]);
        assert!(!h.session.chat_state(&outcome.chat_id).loading);
    }

    #[tokio::test]
    async fn error_after_partial_output_keeps_it() {
        let h = harness(ScriptedChatService::new().with_script(vec![
            reading("Half an ", ""),
            reading("answer", ""),
            Step::Emit(StreamEvent::Error {
                message: "connection reset".into(),
                aborted: false,
            }),
            Step::Fail(InvocationError::StreamInterrupted("connection reset".into())),
        ]));

        let outcome = h.session.submit("hi").await.unwrap().unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        assert!(outcome.produced_output);

        let message = only_message(&h).await;
        assert_eq!(message.reply, "Half an answer");
        assert!(!message.is_active);
        assert!(message.output_tokens.is_some());
        // One notification even though both the event and the call failed
        assert_eq!(h.notifier.errors().len(), 1);
        assert_eq!(h.ledger.len(), 1);
    }

    #[tokio::test]
    async fn call_error_without_events_is_reported_once() {
        let h = harness(ScriptedChatService::new().with_script(vec![Step::Fail(
            InvocationError::AuthenticationFailed("bad key".into()),
        )]));

        let outcome = h.session.submit("hi").await.unwrap().unwrap();
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        assert_eq!(h.notifier.errors().len(), 1);
        assert!(!only_message(&h).await.is_active);
    }

    #[tokio::test]
    async fn abort_is_silent_and_finalizes() {
        let h = harness(
            ScriptedChatService::new().with_script(vec![reading("partial", ""), Step::WaitForAbort]),
        );
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("long task").await });
        let event = wait_for(&mut rx, |e| matches!(e, DomainEvent::ReplyAppended { .. })).await;
        let DomainEvent::ReplyAppended { chat_id, .. } = event.as_ref() else {
            unreachable!()
        };

        assert!(h.session.abort(chat_id));
        let outcome = handle.await.unwrap().unwrap().unwrap();

        assert_eq!(outcome.status, TurnStatus::Aborted);
        assert!(h.notifier.errors().is_empty());
        let message = only_message(&h).await;
        assert_eq!(message.reply, "partial");
        assert!(!message.is_active);
        assert!(!h.session.chat_state(chat_id).loading);
        assert_eq!(h.chat.abort_count(), 1);

        // Nothing left to abort
        assert!(!h.session.abort(chat_id));
    }

    #[tokio::test]
    async fn abort_before_output_leaves_empty_reply() {
        let h = harness(ScriptedChatService::new().with_script(vec![Step::WaitForAbort]));
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("long task").await });
        let event = wait_for(&mut rx, |e| matches!(e, DomainEvent::TurnStarted { .. })).await;
        let DomainEvent::TurnStarted { chat_id, .. } = event.as_ref() else {
            unreachable!()
        };
        h.session.abort(chat_id);

        let outcome = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Aborted);
        assert!(!outcome.produced_output);
        let message = only_message(&h).await;
        assert!(message.reply.is_empty());
        assert!(!message.is_active);
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn abort_during_retrieval_does_not_reach_the_next_turn() {
        let knowledge = Arc::new(GatedKnowledge::failing_once());
        let h = harness_with_knowledge(
            ScriptedChatService::new().with_script(vec![complete("fresh answer")]),
            knowledge.clone(),
        );
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("first").await });
        let event = wait_for(&mut rx, |e| matches!(e, DomainEvent::TurnStarted { .. })).await;
        let DomainEvent::TurnStarted { chat_id, .. } = event.as_ref() else {
            unreachable!()
        };
        assert_eq!(h.session.chat_state(chat_id).phase, TurnPhase::Submitting);
        assert!(h.session.abort(chat_id));

        knowledge.gate.notify_one();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Core(colloquy_core::Error::Retrieval(_))
        ));
        assert!(h.chat.prompts().is_empty());

        let outcome = h.session.submit("second").await.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(&outcome.chat_id, chat_id);
        assert_eq!(h.chat.prompts().len(), 1);
        assert_eq!(h.chat.abort_count(), 0);
    }

    #[tokio::test]
    async fn abort_leaves_other_chats_streaming() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![reading("a", ""), Step::WaitForAbort])
                .with_script(vec![reading("b", ""), Step::Pause(gate.clone()), complete("b")]),
        );
        let other = h
            .store
            .create_chat(NewChat {
                summary: "other".into(),
                folder_id: None,
            })
            .await
            .unwrap();
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let first = tokio::spawn(async move { session.submit("first").await });
        let event = wait_for(&mut rx, |e| matches!(e, DomainEvent::ReplyAppended { .. })).await;
        let DomainEvent::ReplyAppended { chat_id: chat_a, .. } = event.as_ref() else {
            unreachable!()
        };

        h.session.open_chat(other.id.clone(), None).await.unwrap();
        let session = h.session.clone();
        let second = tokio::spawn(async move { session.submit("second").await });
        wait_for(&mut rx, |e| {
            matches!(e, DomainEvent::ReplyAppended { chat_id, .. } if *chat_id == other.id)
        })
        .await;

        assert!(h.session.abort(chat_a));
        let aborted = first.await.unwrap().unwrap().unwrap();
        assert_eq!(aborted.status, TurnStatus::Aborted);
        assert_eq!(h.session.chat_state(&other.id).phase, TurnPhase::Streaming);

        gate.notify_one();
        let outcome = second.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.chat_id, other.id);
        assert_eq!(h.chat.abort_count(), 1);

        let finished = h
            .store
            .fetch_messages(MessageQuery::new(other.id.clone(), ""))
            .await
            .unwrap();
        assert_eq!(finished[0].reply, "b");
    }

    #[tokio::test]
    async fn token_counts_fall_back_to_counter() {
        let h = harness_with_counter(
            ScriptedChatService::new().with_script(vec![complete("An answer")]),
            Arc::new(FixedCounter {
                input: 7,
                output: 11,
            }),
        );
        h.session.submit("question").await.unwrap();

        let message = only_message(&h).await;
        assert_eq!(message.input_tokens, Some(7));
        assert_eq!(message.output_tokens, Some(11));
        assert_eq!(h.ledger.records()[0].output_tokens, 11);
    }

    #[tokio::test]
    async fn knowledge_is_injected_and_citations_resolved() {
        let h = harness(ScriptedChatService::new().with_script(vec![complete(
            "Apples are common [(1)](citation#A 'Fruit Encyclopedia').",
        )]));
        fruit_knowledge(&h);

        let outcome = h.session.submit("common apples").await.unwrap().unwrap();

        let sent = h.chat.prompts();
        assert!(sent[0].contains("# Context #"));
        assert!(sent[0].ends_with("# Objective #\ncommon apples\n"));
        assert!(h.knowledge.cached_chunk("A").is_some());

        let message = only_message(&h).await;
        assert_eq!(message.prompt, "common apples");
        assert_eq!(message.cited_chunks.len(), 1);
        assert_eq!(message.cited_chunks[0].id, "A");
        assert_eq!(message.cited_chunks[0].seq_no, 1);
        assert_eq!(message.cited_files, vec!["Fruit Encyclopedia".to_string()]);

        let trace = h.session.inspector().trace(outcome.chat_id.as_str()).unwrap();
        assert_eq!(trace.count(&SpanKind::Retrieval), 1);
        let retrieval = trace
            .spans
            .iter()
            .find(|s| s.kind == SpanKind::Retrieval)
            .unwrap();
        assert_eq!(retrieval.metadata["chunks"], 2);
    }

    #[tokio::test]
    async fn without_collections_prompt_is_sent_raw() {
        let h = harness(ScriptedChatService::new().with_script(vec![complete("ok")]));
        h.session.submit("plain question").await.unwrap();
        assert_eq!(h.chat.prompts(), vec!["plain question".to_string()]);
    }

    #[tokio::test]
    async fn retrieval_failure_fails_the_turn() {
        let h = harness_with_knowledge(ScriptedChatService::new(), Arc::new(FailingKnowledge));

        let err = h.session.submit("apples").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Core(colloquy_core::Error::Retrieval(_))
        ));
        assert!(h.chat.prompts().is_empty());
        assert_eq!(h.notifier.errors().len(), 1);

        let message = only_message(&h).await;
        assert!(!message.is_active);
        assert!(message.reply.is_empty());
        let chat_id = message.chat_id;
        let state = h.session.chat_state(&chat_id);
        assert!(!state.loading);
        assert_eq!(state.phase, TurnPhase::Idle);
    }

    #[tokio::test]
    async fn concurrent_submit_is_rejected() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![reading("a", ""), Step::Pause(gate.clone()), complete("a")])
                .with_script(vec![complete("b")]),
        );
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("first").await });
        wait_for(&mut rx, |e| matches!(e, DomainEvent::ReplyAppended { .. })).await;

        let err = h.session.submit("second").await.unwrap_err();
        assert!(matches!(err, SessionError::TurnInProgress { .. }));

        gate.notify_one();
        handle.await.unwrap().unwrap();

        // Idle again: the next submit goes through
        let outcome = h.session.submit("second").await.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn turn_keeps_its_chat_after_navigation() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedChatService::new().with_script(vec![
            reading("Hel", ""),
            Step::Pause(gate.clone()),
            reading("lo", ""),
            complete("Hello"),
        ]));
        let other = h
            .store
            .create_chat(NewChat {
                summary: "other".into(),
                folder_id: None,
            })
            .await
            .unwrap();
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("hi").await });
        wait_for(&mut rx, |e| matches!(e, DomainEvent::ReplyAppended { .. })).await;

        h.session.open_chat(other.id.clone(), None).await.unwrap();
        gate.notify_one();
        let outcome = handle.await.unwrap().unwrap().unwrap();

        assert_ne!(outcome.chat_id, other.id);
        assert_eq!(h.session.active_chat(), other.id);
        assert!(h.session.messages().iter().all(|m| m.chat_id == other.id));

        let finished = h
            .store
            .fetch_messages(MessageQuery::new(outcome.chat_id.clone(), ""))
            .await
            .unwrap();
        assert_eq!(finished[0].reply, "Hello");
        assert!(!finished[0].is_active);
        assert!(!h.session.chat_state(&outcome.chat_id).loading);
    }

    #[tokio::test]
    async fn tool_calls_mark_running_tool_until_done() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedChatService::new().with_script(vec![
            Step::Emit(StreamEvent::ToolCalls {
                name: "web_search".into(),
            }),
            Step::Pause(gate.clone()),
            complete("found it"),
        ]));
        let mut rx = h.session.subscribe();

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("search").await });
        let event = wait_for(&mut rx, |e| matches!(e, DomainEvent::ToolRunning { .. })).await;
        let DomainEvent::ToolRunning { chat_id, .. } = event.as_ref() else {
            unreachable!()
        };
        assert_eq!(
            h.session.chat_state(chat_id).running_tool.as_deref(),
            Some("web_search")
        );

        gate.notify_one();
        handle.await.unwrap().unwrap();
        assert!(h.session.chat_state(chat_id).running_tool.is_none());
    }

    #[tokio::test]
    async fn inline_reasoning_is_split_from_reply() {
        let h = harness(ScriptedChatService::new().with_script(vec![complete(
            "<think>the user greets</think>\nHello there",
        )]));
        h.session.submit("hi").await.unwrap();

        let message = only_message(&h).await;
        assert_eq!(message.reply, "Hello there");
        assert_eq!(message.reasoning.as_deref(), Some("the user greets"));
    }

    #[tokio::test]
    async fn trace_is_reset_per_turn() {
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![complete("one")])
                .with_script(vec![complete("two")]),
        );
        let first = h.session.submit("one").await.unwrap().unwrap();
        h.session.submit("two").await.unwrap();

        let trace = h.session.inspector().trace(first.chat_id.as_str()).unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.count(&SpanKind::LlmCall), 1);
    }

    #[tokio::test]
    async fn telemetry_failure_does_not_affect_turn() {
        let h = harness(ScriptedChatService::new().with_script(vec![complete("ok")]));
        h.telemetry.fail();
        let outcome = h.session.submit("hi").await.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn open_chat_loads_messages_and_scrolls_to_anchor() {
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![complete("Rust is a language")])
                .with_script(vec![complete("Python too")]),
        );
        h.session.submit("Tell me about Rust").await.unwrap();
        let outcome = h.session.submit("And Python?").await.unwrap().unwrap();
        let chat_id = outcome.chat_id.clone();
        let mut rx = h.session.subscribe();

        h.session.open_chat(ChatId::temporary(), None).await.unwrap();
        h.session
            .open_chat(chat_id.clone(), Some(outcome.message_id.to_string()))
            .await
            .unwrap();
        wait_for(&mut rx, |e| {
            matches!(e, DomainEvent::MessagesLoaded { chat_id: id, .. } if *id == chat_id)
        })
        .await;

        assert_eq!(h.session.messages().len(), 2);
        assert_eq!(h.viewport.anchors(), vec![outcome.message_id.to_string()]);
    }

    #[tokio::test]
    async fn open_unknown_chat_fails() {
        let h = harness(ScriptedChatService::new());
        let err = h
            .session
            .open_chat(ChatId::from("missing"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Core(colloquy_core::Error::Persistence(
                PersistenceError::ChatNotFound(_)
            ))
        ));
        assert!(h.session.active_chat().is_temporary());
    }

    #[tokio::test]
    async fn opening_temporary_chat_seeds_folder_collections() {
        let h = harness(ScriptedChatService::new());
        h.knowledge.add_collection(KnowledgeCollection {
            id: "k1".into(),
            name: "Handbook".into(),
        });
        h.session.select_folder(Some(Folder {
            id: "work".into(),
            name: "Work".into(),
            collection_ids: vec!["k1".into()],
        }));

        h.session.open_chat(ChatId::temporary(), None).await.unwrap();
        let attached = h
            .knowledge
            .list_chat_collections(&ChatId::temporary())
            .await
            .unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, "k1");
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_filters_loaded_messages() {
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![complete("Rust is a language")])
                .with_script(vec![complete("Python too")]),
        );
        h.session.submit("Tell me about Rust").await.unwrap();
        let outcome = h.session.submit("And Python?").await.unwrap().unwrap();
        let chat_id = outcome.chat_id;
        let mut rx = h.session.subscribe();

        h.session.set_keyword(&chat_id, "rust");
        wait_for(&mut rx, |e| matches!(e, DomainEvent::MessagesLoaded { .. })).await;
        let shown = h.session.messages();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].prompt, "Tell me about Rust");

        // A second change inside the wait window lands on the trailing edge
        h.session.set_keyword(&chat_id, "");
        h.session.set_keyword(&chat_id, "python");
        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        let event = wait_for(&mut rx, |e| matches!(e, DomainEvent::MessagesLoaded { .. })).await;
        assert!(matches!(event.as_ref(), DomainEvent::MessagesLoaded { count: 1, .. }));
        assert_eq!(h.session.messages()[0].prompt, "And Python?");
    }

    #[tokio::test]
    async fn slow_fetch_keeps_streaming_placeholder() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedChatService::new()
                .with_script(vec![complete("one")])
                .with_script(vec![
                    reading("partial", ""),
                    Step::Pause(gate.clone()),
                    complete("partial"),
                ]),
        );
        let chat_id = h
            .session
            .submit("first question")
            .await
            .unwrap()
            .unwrap()
            .chat_id;
        h.fetch.set_delay(std::time::Duration::from_millis(50));
        let mut rx = h.session.subscribe();

        // The fetch reads its rows before the second turn's placeholder exists
        h.session.set_keyword(&chat_id, "first");
        tokio::task::yield_now().await;

        let session = h.session.clone();
        let handle = tokio::spawn(async move { session.submit("second question").await });
        wait_for(&mut rx, |e| matches!(e, DomainEvent::ReplyAppended { .. })).await;
        wait_for(&mut rx, |e| matches!(e, DomainEvent::MessagesLoaded { .. })).await;

        let shown = h.session.messages();
        let streaming = shown
            .iter()
            .find(|m| m.prompt == "second question")
            .expect("placeholder stays in view");
        assert!(streaming.is_active);
        assert_eq!(streaming.reply, "partial");

        gate.notify_one();
        let outcome = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn failed_fetch_is_reported_and_keeps_view() {
        let h = harness(ScriptedChatService::new().with_script(vec![complete("Rust is a language")]));
        let chat_id = h
            .session
            .submit("Tell me about Rust")
            .await
            .unwrap()
            .unwrap()
            .chat_id;
        h.fetch.fail();
        let mut rx = h.session.subscribe();

        h.session.set_keyword(&chat_id, "rust");
        let event = wait_for(&mut rx, |e| {
            matches!(
                e,
                DomainEvent::MessagesLoaded { .. } | DomainEvent::MessagesLoadFailed { .. }
            )
        })
        .await;
        let DomainEvent::MessagesLoadFailed { chat_id: failed, error } = event.as_ref() else {
            panic!("expected a load failure, got {event:?}");
        };
        assert_eq!(failed, &chat_id);
        assert!(error.contains("disk unavailable"));
        assert_eq!(h.session.messages().len(), 1);
    }
}
