//! Scripted collaborators for session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use colloquy_config::AppConfig;
use colloquy_core::chat::{Chat, ChatId, ChatUpdate, NewChat};
use colloquy_core::error::{InvocationError, PersistenceError, RetrievalError, TelemetryError};
use colloquy_core::invocation::{
    ChatMessage, ChatResult, ChatService, EventSender, InvocationContext, StreamEvent,
};
use colloquy_core::knowledge::{
    KnowledgeChunk, KnowledgeCollection, KnowledgeFile, KnowledgeService,
};
use colloquy_core::message::{Message, MessageQuery, MessageUpdate, NewMessage};
use colloquy_core::presentation::{Notifier, Viewport};
use colloquy_core::store::ChatStore;
use colloquy_core::usage::{TelemetryEvent, TelemetrySink};
use colloquy_store::{InMemoryChatStore, InMemoryKnowledgeStore};
use colloquy_telemetry::UsageLedger;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::session::{ChatSession, Services};
use crate::token::TokenCounter;

/// One step of a scripted model call.
pub(crate) enum Step {
    Emit(StreamEvent),
    /// Block until the gate is notified
    Pause(Arc<Notify>),
    /// Block until the call's token is cancelled, then report the abort
    WaitForAbort,
    /// End the call with an error
    Fail(InvocationError),
}

pub(crate) fn reading(content: &str, reasoning: &str) -> Step {
    Step::Emit(StreamEvent::Reading {
        content: content.into(),
        reasoning: reasoning.into(),
    })
}

pub(crate) fn complete(content: &str) -> Step {
    Step::Emit(StreamEvent::Complete(ChatResult {
        content: content.into(),
        ..ChatResult::default()
    }))
}

/// A chat service that plays back one script per call.
pub(crate) struct ScriptedChatService {
    ready: AtomicBool,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    received: Mutex<Vec<Vec<ChatMessage>>>,
    aborts: AtomicUsize,
}

impl ScriptedChatService {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            scripts: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            aborts: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().push_back(steps);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// The user message of every call, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|messages| messages.last().map(|m| m.content.clone()))
            .collect()
    }

    /// Calls that ended because their token was cancelled.
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatService for ScriptedChatService {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn context(&self) -> InvocationContext {
        InvocationContext {
            model: "mock-model".into(),
            temperature: 0.7,
            max_tokens: Some(1024),
        }
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<(), InvocationError> {
        self.received.lock().unwrap().push(messages);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![complete("")]);

        for step in script {
            match step {
                Step::Emit(event) => {
                    let _ = events.send(event).await;
                }
                Step::Pause(gate) => gate.notified().await,
                Step::WaitForAbort => {
                    cancel.cancelled().await;
                    self.aborts.fetch_add(1, Ordering::SeqCst);
                    let _ = events
                        .send(StreamEvent::Error {
                            message: "aborted".into(),
                            aborted: true,
                        })
                        .await;
                    return Err(InvocationError::Aborted);
                }
                Step::Fail(error) => return Err(error),
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    errors: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

#[derive(Default)]
pub(crate) struct RecordingViewport {
    bottom: AtomicUsize,
    anchors: Mutex<Vec<String>>,
}

impl RecordingViewport {
    pub fn bottom_scrolls(&self) -> usize {
        self.bottom.load(Ordering::SeqCst)
    }

    pub fn anchors(&self) -> Vec<String> {
        self.anchors.lock().unwrap().clone()
    }
}

impl Viewport for RecordingViewport {
    fn scroll_to_bottom(&self) {
        self.bottom.fetch_add(1, Ordering::SeqCst);
    }

    fn scroll_to_anchor(&self, anchor: &str) {
        self.anchors.lock().unwrap().push(anchor.to_string());
    }
}

#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    batches: Mutex<Vec<Vec<TelemetryEvent>>>,
    failing: AtomicBool,
}

impl RecordingTelemetry {
    /// Reject every batch from now on.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<TelemetryEvent>> {
        self.batches.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn ingest_event(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Unavailable("offline".into()));
        }
        self.batches.lock().unwrap().push(events);
        Ok(())
    }
}

/// Knowledge service whose search always fails. Every chat has one
/// collection attached.
pub(crate) struct FailingKnowledge;

#[async_trait]
impl KnowledgeService for FailingKnowledge {
    async fn search(
        &self,
        _collection_ids: &[String],
        _query: &str,
    ) -> Result<Vec<KnowledgeChunk>, RetrievalError> {
        Err(RetrievalError::SearchFailed("index offline".into()))
    }

    fn cache_chunks(&self, _chunks: &[KnowledgeChunk]) {}

    async fn get_files(&self, _file_ids: &[String]) -> Result<Vec<KnowledgeFile>, RetrievalError> {
        Ok(Vec::new())
    }

    async fn list_chat_collections(
        &self,
        _chat_id: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError> {
        Ok(vec![KnowledgeCollection {
            id: "k1".into(),
            name: "Offline".into(),
        }])
    }

    async fn set_chat_collections(
        &self,
        _chat_id: &ChatId,
        _collection_ids: &[String],
    ) -> Result<(), RetrievalError> {
        Ok(())
    }

    async fn move_chat_collections(
        &self,
        _from: &ChatId,
        _to: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError> {
        Ok(Vec::new())
    }
}

/// Knowledge service whose first search waits for a gate and then fails.
/// Later searches find nothing. Every chat has one collection attached.
pub(crate) struct GatedKnowledge {
    pub gate: Notify,
    failures: AtomicUsize,
}

impl GatedKnowledge {
    pub fn failing_once() -> Self {
        Self {
            gate: Notify::new(),
            failures: AtomicUsize::new(1),
        }
    }
}

#[async_trait]
impl KnowledgeService for GatedKnowledge {
    async fn search(
        &self,
        _collection_ids: &[String],
        _query: &str,
    ) -> Result<Vec<KnowledgeChunk>, RetrievalError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.gate.notified().await;
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(RetrievalError::SearchFailed("index offline".into()));
        }
        Ok(Vec::new())
    }

    fn cache_chunks(&self, _chunks: &[KnowledgeChunk]) {}

    async fn get_files(&self, _file_ids: &[String]) -> Result<Vec<KnowledgeFile>, RetrievalError> {
        Ok(Vec::new())
    }

    async fn list_chat_collections(
        &self,
        _chat_id: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError> {
        Ok(vec![KnowledgeCollection {
            id: "k1".into(),
            name: "Flaky".into(),
        }])
    }

    async fn set_chat_collections(
        &self,
        _chat_id: &ChatId,
        _collection_ids: &[String],
    ) -> Result<(), RetrievalError> {
        Ok(())
    }

    async fn move_chat_collections(
        &self,
        _from: &ChatId,
        _to: &ChatId,
    ) -> Result<Vec<KnowledgeCollection>, RetrievalError> {
        Ok(Vec::new())
    }
}

/// In-memory chat store whose message fetches can be slowed down or failed.
/// A slow fetch reads its rows first and returns them after the delay.
pub(crate) struct FetchControl {
    inner: Arc<InMemoryChatStore>,
    delay_ms: AtomicUsize,
    failing: AtomicBool,
}

impl FetchControl {
    fn new(inner: Arc<InMemoryChatStore>) -> Self {
        Self {
            inner,
            delay_ms: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatStore for FetchControl {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_chat(&self, fields: NewChat) -> Result<Chat, PersistenceError> {
        self.inner.create_chat(fields).await
    }

    async fn update_chat(&self, update: ChatUpdate) -> Result<(), PersistenceError> {
        self.inner.update_chat(update).await
    }

    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, PersistenceError> {
        self.inner.get_chat(id).await
    }

    async fn create_message(&self, fields: NewMessage) -> Result<Message, PersistenceError> {
        self.inner.create_message(fields).await
    }

    async fn update_message(&self, update: MessageUpdate) -> Result<(), PersistenceError> {
        self.inner.update_message(update).await
    }

    async fn fetch_messages(&self, query: MessageQuery) -> Result<Vec<Message>, PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("disk unavailable".into()));
        }
        let rows = self.inner.fetch_messages(query).await?;
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        Ok(rows)
    }
}

pub(crate) struct FixedCounter {
    pub input: u32,
    pub output: u32,
}

impl TokenCounter for FixedCounter {
    fn count_input(&self, _text: &str) -> u32 {
        self.input
    }

    fn count_output(&self, _text: &str) -> u32 {
        self.output
    }
}

pub(crate) struct Harness {
    pub session: ChatSession,
    pub store: Arc<InMemoryChatStore>,
    /// The store as the session sees it
    pub fetch: Arc<FetchControl>,
    pub knowledge: Arc<InMemoryKnowledgeStore>,
    pub chat: Arc<ScriptedChatService>,
    pub notifier: Arc<RecordingNotifier>,
    pub viewport: Arc<RecordingViewport>,
    pub ledger: Arc<UsageLedger>,
    pub telemetry: Arc<RecordingTelemetry>,
}

fn build(
    chat: ScriptedChatService,
    knowledge: Option<Arc<dyn KnowledgeService>>,
    counter: Option<Arc<dyn TokenCounter>>,
) -> Harness {
    let store = Arc::new(InMemoryChatStore::new());
    let fetch = Arc::new(FetchControl::new(store.clone()));
    let in_memory = Arc::new(InMemoryKnowledgeStore::new());
    let chat = Arc::new(chat);
    let notifier = Arc::new(RecordingNotifier::default());
    let viewport = Arc::new(RecordingViewport::default());
    let ledger = Arc::new(UsageLedger::new());
    let telemetry = Arc::new(RecordingTelemetry::default());

    let services = Services {
        store: fetch.clone(),
        chat: chat.clone(),
        knowledge: knowledge.unwrap_or_else(|| in_memory.clone() as Arc<dyn KnowledgeService>),
        usage: ledger.clone(),
        telemetry: telemetry.clone(),
        notifier: notifier.clone(),
        viewport: viewport.clone(),
    };
    let mut builder = ChatSession::builder(services, &AppConfig::default());
    if let Some(counter) = counter {
        builder = builder.with_token_counter(counter);
    }

    Harness {
        session: builder.build(),
        store,
        fetch,
        knowledge: in_memory,
        chat,
        notifier,
        viewport,
        ledger,
        telemetry,
    }
}

pub(crate) fn harness(chat: ScriptedChatService) -> Harness {
    build(chat, None, None)
}

pub(crate) fn harness_with_knowledge(
    chat: ScriptedChatService,
    knowledge: Arc<dyn KnowledgeService>,
) -> Harness {
    build(chat, Some(knowledge), None)
}

pub(crate) fn harness_with_counter(
    chat: ScriptedChatService,
    counter: Arc<dyn TokenCounter>,
) -> Harness {
    build(chat, None, Some(counter))
}
