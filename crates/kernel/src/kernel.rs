//! The kernel: one invocation surface over the function registry, prompt
//! renderer, filter chains, completion backend and memory store.
//!
//! Every invocation follows the same state machine:
//!
//! ```text
//! render (prompt filters) -> dispatch -> completed
//!                                 |
//!                                 +-> tool calls requested -> invoke (function filters) -> dispatch ...
//! ```
//!
//! Dispatch/invoke round trips are capped by `max_tool_rounds`.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rustedkernel_config::{KernelConfig, MemoryBackendKind, MemoryConfig};
use rustedkernel_core::backend::{
    ChunkReceiver, CompletionBackend, CompletionRequest, CompletionResponse, ToolDefinition,
    UnconfiguredBackend, Usage,
};
use rustedkernel_core::error::{BackendError, Error, FunctionError, Result};
use rustedkernel_core::event::{EventBus, KernelEvent};
use rustedkernel_core::function::{
    FunctionBody, FunctionResult, InputVariable, KernelArguments, KernelFunction, Plugin,
    PromptFunction,
};
use rustedkernel_core::memory::{DEFAULT_TOP_K, SearchHit, SimilarityMetric, VectorStore};
use rustedkernel_core::message::{ChatHistory, ChatMessage, ToolCallRequest};
use rustedkernel_core::registry::{FunctionInvoker, FunctionRegistry};
use rustedkernel_core::settings::{ExecutionSettings, FunctionChoiceBehavior, ToolFailurePolicy};
use rustedkernel_memory::{
    InMemoryVectorStore, JsonFileVectorStore, TextEntry, embed_and_upsert, search_text,
    text_schema,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::filter::{
    FilterChain, FunctionInvocationContext, FunctionInvocationFilter, PromptRenderContext,
    PromptRenderFilter, Terminal,
};
use crate::stream::{ChatStream, EVENT_CHANNEL_CAPACITY, StreamEvent};
use crate::template::PromptTemplate;

/// The result of [`Kernel::invoke_prompt`].
#[derive(Debug, Clone)]
pub struct PromptResult {
    /// The prompt as sent to the backend, after render filters
    pub rendered_prompt: String,

    /// Content of the final assistant message
    pub content: String,

    pub message: ChatMessage,

    /// Number of backend dispatches
    pub rounds: u32,

    /// Usage summed over all rounds
    pub usage: Option<Usage>,
}

/// What one run of the tool-calling loop produced.
struct LoopOutcome {
    message: ChatMessage,
    /// Everything appended after the input history, final message included
    appended: Vec<ChatMessage>,
    rounds: u32,
    usage: Option<Usage>,
}

struct KernelInner {
    registry: FunctionRegistry,
    backend: Arc<dyn CompletionBackend>,
    memory: Option<Arc<dyn VectorStore>>,
    prompt_filters: FilterChain<PromptRenderContext>,
    function_filters: FilterChain<FunctionInvocationContext>,
    events: Arc<EventBus>,
    settings: ExecutionSettings,
    metric: SimilarityMetric,
    top_k: usize,
    dimensions: Option<usize>,
}

/// The function-calling kernel. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("functions", &self.inner.registry.names())
            .field("backend", &self.inner.backend.name())
            .field("memory", &self.inner.memory.as_ref().map(|m| m.name().to_string()))
            .field("prompt_filters", &self.inner.prompt_filters.names())
            .field("function_filters", &self.inner.function_filters.names())
            .finish()
    }
}

/// Assembles a [`Kernel`] from its collaborators.
pub struct KernelBuilder {
    plugins: Vec<Plugin>,
    backend: Option<Arc<dyn CompletionBackend>>,
    memory: Option<Arc<dyn VectorStore>>,
    prompt_filters: FilterChain<PromptRenderContext>,
    function_filters: FilterChain<FunctionInvocationContext>,
    events: Option<Arc<EventBus>>,
    settings: ExecutionSettings,
    metric: SimilarityMetric,
    top_k: usize,
    dimensions: Option<usize>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            backend: None,
            memory: None,
            prompt_filters: FilterChain::new(),
            function_filters: FilterChain::new(),
            events: None,
            settings: ExecutionSettings::default(),
            metric: SimilarityMetric::default(),
            top_k: DEFAULT_TOP_K,
            dimensions: None,
        }
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn VectorStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Filters run in the order they are added.
    pub fn with_prompt_filter(mut self, filter: Arc<PromptRenderFilter>) -> Self {
        self.prompt_filters.push(filter);
        self
    }

    pub fn with_function_filter(mut self, filter: Arc<FunctionInvocationFilter>) -> Self {
        self.function_filters.push(filter);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Defaults for prompt functions that carry no settings of their own.
    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Take execution defaults and memory options from configuration.
    pub fn with_config(mut self, config: &KernelConfig) -> Self {
        self.settings = config.execution_settings();
        self.metric = config.memory.metric;
        self.top_k = config.memory.top_k;
        self.dimensions = config.memory.dimensions;
        self
    }

    /// Register every plugin and build the kernel.
    ///
    /// Fails with [`FunctionError::DuplicateName`] on the first name clash.
    pub fn build(self) -> Result<Kernel> {
        let mut registry = FunctionRegistry::new();
        for plugin in self.plugins {
            registry.register(plugin)?;
        }
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(UnconfiguredBackend));

        info!(
            functions = registry.len(),
            backend = backend.name(),
            memory = self.memory.is_some(),
            "Kernel built"
        );

        Ok(Kernel {
            inner: Arc::new(KernelInner {
                registry,
                backend,
                memory: self.memory,
                prompt_filters: self.prompt_filters,
                function_filters: self.function_filters,
                events: self.events.unwrap_or_default(),
                settings: self.settings,
                metric: self.metric,
                top_k: self.top_k,
                dimensions: self.dimensions,
            }),
        })
    }
}

/// Open the vector store selected by `[memory]`.
pub async fn open_store(config: &MemoryConfig) -> Result<Arc<dyn VectorStore>> {
    Ok(match config.backend {
        MemoryBackendKind::InMemory => Arc::new(InMemoryVectorStore::new()),
        MemoryBackendKind::JsonFile => Arc::new(JsonFileVectorStore::open(config.store_dir()).await?),
    })
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    pub fn backend(&self) -> &Arc<dyn CompletionBackend> {
        &self.inner.backend
    }

    pub fn memory(&self) -> Option<&Arc<dyn VectorStore>> {
        self.inner.memory.as_ref()
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<KernelEvent>> {
        self.inner.events.subscribe()
    }

    // ── Rendering ──

    /// Render `template` through the prompt filters. Never calls the backend
    /// unless an inline call reaches a prompt function.
    pub async fn render_prompt(
        &self,
        template: &str,
        arguments: &KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.render_with(template, arguments, &[], cancel).await
    }

    async fn render_with(
        &self,
        template: &str,
        arguments: &KernelArguments,
        defaults: &[InputVariable],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut context = PromptRenderContext {
            template: template.to_string(),
            arguments: arguments.clone(),
            rendered_prompt: None,
            cancellation: cancel.clone(),
        };
        let stage = RenderStage {
            kernel: self,
            defaults,
        };
        self.inner.prompt_filters.run(&mut context, &stage).await?;

        let rendered = context.rendered_prompt.ok_or_else(|| Error::Filter {
            filter: "prompt_render".into(),
            reason: "the chain finished without a rendered prompt".into(),
        })?;
        self.inner.events.publish(KernelEvent::PromptRendered {
            prompt_chars: rendered.chars().count(),
            timestamp: Utc::now(),
        });
        Ok(rendered)
    }

    // ── Functions ──

    /// Invoke a registered function, native or prompt, through the function
    /// filters. Accepts `Plugin.Function` and `Plugin-Function`.
    pub async fn invoke_function(
        &self,
        name: &str,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<FunctionResult> {
        let function = self.inner.registry.resolve(name)?.clone();
        let qualified = function.qualified_name();
        let arguments = function.coerce_arguments(arguments)?;

        let mut context = FunctionInvocationContext {
            function: function.metadata().clone(),
            arguments,
            result: None,
            cancellation: cancel.clone(),
        };
        let stage = FunctionStage {
            kernel: self,
            function: &function,
        };

        let started = Instant::now();
        let outcome = self.inner.function_filters.run(&mut context, &stage).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(function = %qualified, duration_ms, success = outcome.is_ok(), "Function invoked");
        self.inner.events.publish(KernelEvent::FunctionInvoked {
            function: qualified.clone(),
            success: outcome.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });
        outcome?;

        context.result.ok_or_else(|| Error::Filter {
            filter: "function_invocation".into(),
            reason: format!("the chain finished without a result for {qualified}"),
        })
    }

    async fn run_prompt_function(
        &self,
        prompt: &PromptFunction,
        arguments: &KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let rendered = self
            .render_with(&prompt.template, arguments, &prompt.input_variables, cancel)
            .await?;
        let settings = prompt
            .execution_settings
            .as_ref()
            .unwrap_or(&self.inner.settings);
        let outcome = self
            .run_loop(vec![ChatMessage::user(rendered)], settings, cancel)
            .await?;
        Ok(outcome.message.content)
    }

    // ── Invocation ──

    /// Render `template`, send it as a user message and run the tool loop.
    pub async fn invoke_prompt(
        &self,
        template: &str,
        arguments: &KernelArguments,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<PromptResult> {
        let rendered = self.render_prompt(template, arguments, cancel).await?;
        let outcome = self
            .run_loop(vec![ChatMessage::user(rendered.clone())], settings, cancel)
            .await
            .inspect_err(|e| self.publish_error("invoke_prompt", e))?;

        Ok(PromptResult {
            rendered_prompt: rendered,
            content: outcome.message.content.clone(),
            message: outcome.message,
            rounds: outcome.rounds,
            usage: outcome.usage,
        })
    }

    /// Run the tool loop over `history` and return the final assistant
    /// message. `history` is not modified.
    pub async fn invoke_chat(
        &self,
        history: &ChatHistory,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage> {
        Ok(self.chat(history, settings, cancel).await?.message)
    }

    /// Like [`invoke_chat`](Self::invoke_chat), but appends the turn to
    /// `history`: assistant tool-call messages, tool results and the final
    /// reply. Nothing is appended when the turn fails.
    pub async fn invoke_chat_appending(
        &self,
        history: &mut ChatHistory,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage> {
        let outcome = self.chat(history, settings, cancel).await?;
        history.extend(outcome.appended)?;
        Ok(outcome.message)
    }

    async fn chat(
        &self,
        history: &ChatHistory,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome> {
        if history.is_empty() {
            return Err(Error::InvalidHistory("cannot invoke an empty chat history".into()));
        }
        self.run_loop(history.messages().to_vec(), settings, cancel)
            .await
            .inspect_err(|e| self.publish_error("invoke_chat", e))
    }

    /// The automatic function-calling loop.
    async fn run_loop(
        &self,
        mut messages: Vec<ChatMessage>,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome> {
        let auto = settings.function_choice == FunctionChoiceBehavior::Auto;
        let tools = self.tools_for(settings);
        let atomic = self.atomic_tool_results(settings);
        let start = messages.len();
        let mut usage = None;
        let mut round: u32 = 0;

        loop {
            round += 1;
            debug!(round, messages = messages.len(), tools = tools.len(), "Dispatching to backend");

            let request = CompletionRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                settings: settings.clone(),
                stream: false,
            };
            let response = self.dispatch(request, settings, cancel).await?;
            usage = merge_usage(usage, response.usage);
            self.publish_response(&response.model, round, &response);

            let mut message = response.message;
            if !auto || !message.has_tool_calls() {
                message.tool_calls.clear();
                messages.push(message.clone());
                return Ok(LoopOutcome {
                    message,
                    appended: messages.split_off(start),
                    rounds: round,
                    usage,
                });
            }

            if round > settings.max_tool_rounds {
                warn!(max_rounds = settings.max_tool_rounds, "Tool call round cap reached");
                return Err(Error::ToolCallLoopExceeded {
                    max_rounds: settings.max_tool_rounds,
                });
            }

            let calls = message.tool_calls.clone();
            debug!(round, tool_count = calls.len(), "Executing tool calls");
            messages.push(message);
            let results = self.invoke_tool_calls(&calls, atomic, cancel).await?;
            messages.extend(results);
        }
    }

    fn tools_for(&self, settings: &ExecutionSettings) -> Vec<ToolDefinition> {
        match settings.function_choice {
            FunctionChoiceBehavior::Auto => self.inner.registry.list_for_model(),
            FunctionChoiceBehavior::None => Vec::new(),
        }
    }

    fn atomic_tool_results(&self, settings: &ExecutionSettings) -> bool {
        settings.tool_failure == ToolFailurePolicy::Abort
            || self.inner.backend.requires_atomic_tool_results()
    }

    async fn dispatch(
        &self,
        request: CompletionRequest,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let backend = &self.inner.backend;
        let call = async {
            match settings.timeout() {
                Some(limit) => match tokio::time::timeout(limit, backend.complete(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout {
                        timeout_secs: limit.as_secs(),
                    }),
                },
                None => backend.complete(request).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = call => result.map_err(|e| {
                warn!(backend = backend.name(), error = %e, "Backend dispatch failed");
                Error::Backend(e)
            }),
        }
    }

    /// Run every call of one round concurrently; results keep request order.
    ///
    /// A failed call becomes a tool error message unless `atomic`, in which
    /// case the round fails with a function execution error. Cancellation
    /// and filter errors always fail the round.
    async fn invoke_tool_calls(
        &self,
        calls: &[ToolCallRequest],
        atomic: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>> {
        let outcomes = join_all(calls.iter().map(|call| self.invoke_tool_call(call, cancel))).await;

        let mut messages = Vec::with_capacity(calls.len());
        for (call, outcome) in calls.iter().zip(outcomes) {
            match outcome {
                Ok(result) => messages.push(ChatMessage::tool_result(&call.id, result.as_text())),
                Err(e @ (Error::Cancelled | Error::Filter { .. })) => return Err(e),
                Err(e) if atomic => {
                    warn!(function = %call.name, error = %e, "Tool call failed, aborting round");
                    return Err(as_execution_error(&call.name, e));
                }
                Err(e) => {
                    warn!(function = %call.name, error = %e, "Tool call failed");
                    messages.push(ChatMessage::tool_error(&call.id, e));
                }
            }
        }
        Ok(messages)
    }

    async fn invoke_tool_call(
        &self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Result<FunctionResult> {
        let arguments = parse_tool_arguments(call)?;
        debug!(function = %call.name, id = %call.id, "Invoking requested function");
        self.invoke_function(&call.name, arguments, cancel).await
    }

    // ── Streaming ──

    /// Stream a chat turn. Content deltas are forwarded as the backend
    /// produces them; tool calls are resolved once their round's stream
    /// ends, then a new round starts. Must be called inside a Tokio runtime.
    pub fn stream_chat(
        &self,
        history: &ChatHistory,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> ChatStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let kernel = self.clone();
        let messages = history.messages().to_vec();
        let settings = settings.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if let Err(e) = kernel.stream_rounds(messages, &settings, &cancel, &tx).await {
                kernel.publish_error("stream_chat", &e);
                let _ = tx.send(Err(e)).await;
            }
        });
        ChatStream::new(rx)
    }

    /// Render `template` and stream the reply to it as a user message.
    pub async fn stream_prompt(
        &self,
        template: &str,
        arguments: &KernelArguments,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
    ) -> Result<ChatStream> {
        let rendered = self.render_prompt(template, arguments, cancel).await?;
        let mut history = ChatHistory::new();
        history.add_user_message(rendered);
        Ok(self.stream_chat(&history, settings, cancel))
    }

    async fn stream_rounds(
        &self,
        mut messages: Vec<ChatMessage>,
        settings: &ExecutionSettings,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<Result<StreamEvent>>,
    ) -> Result<()> {
        if messages.is_empty() {
            return Err(Error::InvalidHistory("cannot stream an empty chat history".into()));
        }
        let auto = settings.function_choice == FunctionChoiceBehavior::Auto;
        let tools = self.tools_for(settings);
        let atomic = self.atomic_tool_results(settings);
        let model = settings.model.clone().unwrap_or_default();
        let mut usage = None;
        let mut round: u32 = 0;

        loop {
            round += 1;
            debug!(round, messages = messages.len(), "Streaming from backend");
            let request = CompletionRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                settings: settings.clone(),
                stream: true,
            };
            // The per-call timeout covers the whole round, not just opening it.
            let deadline = settings.timeout().map(|limit| tokio::time::Instant::now() + limit);
            let mut chunks = self.open_stream(request, settings, deadline, cancel).await?;

            let mut content = String::new();
            let mut tool_calls = Vec::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = expire(deadline) => {
                        warn!(round, "Backend stream stalled past the timeout");
                        return Err(stream_timeout(settings));
                    }
                    chunk = chunks.recv() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = chunk?;
                if let Some(delta) = chunk.content
                    && !delta.is_empty()
                {
                    content.push_str(&delta);
                    if tx.send(Ok(StreamEvent::Content { delta })).await.is_err() {
                        debug!("Stream consumer went away");
                        return Ok(());
                    }
                }
                tool_calls.extend(chunk.tool_calls);
                usage = merge_usage(usage, chunk.usage);
                if chunk.done {
                    break;
                }
            }

            self.inner.events.publish(KernelEvent::ResponseGenerated {
                backend: self.inner.backend.name().to_string(),
                model: model.clone(),
                round,
                tool_calls: tool_calls.len(),
                tokens_used: usage.map(|u| u.total_tokens).unwrap_or_default(),
                timestamp: Utc::now(),
            });

            if !auto || tool_calls.is_empty() {
                let _ = tx
                    .send(Ok(StreamEvent::Done {
                        content,
                        rounds: round,
                        usage,
                    }))
                    .await;
                return Ok(());
            }

            if round > settings.max_tool_rounds {
                warn!(max_rounds = settings.max_tool_rounds, "Tool call round cap reached while streaming");
                return Err(Error::ToolCallLoopExceeded {
                    max_rounds: settings.max_tool_rounds,
                });
            }

            for call in &tool_calls {
                let event = StreamEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                };
                if tx.send(Ok(event)).await.is_err() {
                    return Ok(());
                }
            }

            messages.push(ChatMessage::assistant_tool_calls(content, tool_calls.clone()));
            let results = self.invoke_tool_calls(&tool_calls, atomic, cancel).await?;
            for (call, result) in tool_calls.iter().zip(&results) {
                let event = StreamEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    content: result.content.clone(),
                    success: !result.metadata.contains_key("error"),
                };
                if tx.send(Ok(event)).await.is_err() {
                    return Ok(());
                }
            }
            messages.extend(results);
        }
    }

    async fn open_stream(
        &self,
        request: CompletionRequest,
        settings: &ExecutionSettings,
        deadline: Option<tokio::time::Instant>,
        cancel: &CancellationToken,
    ) -> Result<ChunkReceiver> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = expire(deadline) => Err(stream_timeout(settings)),
            result = self.inner.backend.stream(request) => result.map_err(Error::Backend),
        }
    }

    // ── Memory ──

    fn store(&self) -> Result<&Arc<dyn VectorStore>> {
        self.inner.memory.as_ref().ok_or_else(|| Error::Config {
            message: "no memory store was configured for this kernel".into(),
        })
    }

    /// Embed `entries` with the backend and upsert them into `collection`.
    /// Returns the stored keys in input order.
    pub async fn save_texts(
        &self,
        collection: &str,
        entries: Vec<TextEntry>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let store = self.store()?;
        if let Some(dimensions) = self.inner.dimensions
            && store.collection_schema(collection).await?.is_none()
        {
            store
                .ensure_collection(collection, text_schema(dimensions, self.inner.metric))
                .await?;
        }

        let keys = embed_and_upsert(
            self.inner.backend.as_ref(),
            store.as_ref(),
            collection,
            entries,
            self.inner.metric,
            cancel,
        )
        .await
        .inspect_err(|e| self.publish_error("save_texts", e))?;

        info!(collection, count = keys.len(), "Saved texts to memory");
        self.inner.events.publish(KernelEvent::MemoryUpserted {
            collection: collection.to_string(),
            count: keys.len(),
            timestamp: Utc::now(),
        });
        Ok(keys)
    }

    /// Embed `query` and return the closest records of `collection`.
    /// `top_k` defaults to the configured value.
    pub async fn search_text(
        &self,
        collection: &str,
        query: &str,
        top_k: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let store = self.store()?;
        search_text(
            self.inner.backend.as_ref(),
            store.as_ref(),
            collection,
            query,
            top_k.unwrap_or(self.inner.top_k),
            None,
            cancel,
        )
        .await
    }

    // ── Events ──

    fn publish_response(&self, model: &str, round: u32, response: &CompletionResponse) {
        self.inner.events.publish(KernelEvent::ResponseGenerated {
            backend: self.inner.backend.name().to_string(),
            model: model.to_string(),
            round,
            tool_calls: response.message.tool_calls.len(),
            tokens_used: response.usage.map(|u| u.total_tokens).unwrap_or_default(),
            timestamp: Utc::now(),
        });
    }

    fn publish_error(&self, context: &str, error: &Error) {
        self.inner.events.publish(KernelEvent::ErrorOccurred {
            context: context.to_string(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl FunctionInvoker for Kernel {
    async fn invoke_function(
        &self,
        name: &str,
        arguments: KernelArguments,
        cancel: &CancellationToken,
    ) -> Result<FunctionResult> {
        Kernel::invoke_function(self, name, arguments, cancel).await
    }
}

/// Innermost stage of the prompt filters: parse and render.
struct RenderStage<'a> {
    kernel: &'a Kernel,
    defaults: &'a [InputVariable],
}

#[async_trait]
impl Terminal<PromptRenderContext> for RenderStage<'_> {
    async fn run(&self, context: &mut PromptRenderContext) -> Result<()> {
        let template = PromptTemplate::parse(&context.template)?;
        let rendered = template
            .render(
                &context.arguments,
                self.defaults,
                self.kernel,
                &context.cancellation,
            )
            .await?;
        context.rendered_prompt = Some(rendered);
        Ok(())
    }
}

/// Innermost stage of the function filters: run the function body.
struct FunctionStage<'a> {
    kernel: &'a Kernel,
    function: &'a KernelFunction,
}

#[async_trait]
impl Terminal<FunctionInvocationContext> for FunctionStage<'_> {
    async fn run(&self, context: &mut FunctionInvocationContext) -> Result<()> {
        let qualified = self.function.qualified_name();
        let value = match self.function.body() {
            FunctionBody::Native(body) => tokio::select! {
                biased;
                _ = context.cancellation.cancelled() => return Err(Error::Cancelled),
                result = body.invoke(context.arguments.clone(), &context.cancellation) => {
                    result.map_err(|e| FunctionError::execution(qualified.clone(), e))?
                }
            },
            FunctionBody::Prompt(prompt) => serde_json::Value::String(
                self.kernel
                    .run_prompt_function(prompt, &context.arguments, &context.cancellation)
                    .await?,
            ),
        };
        context.result = Some(FunctionResult::new(qualified, value));
        Ok(())
    }
}

/// Parse a tool call's JSON arguments. An empty string means no arguments.
fn parse_tool_arguments(call: &ToolCallRequest) -> Result<KernelArguments> {
    let argument_error = |reason: String| FunctionError::Argument {
        function: call.name.clone(),
        parameter: "arguments".into(),
        reason,
    };
    if call.arguments.trim().is_empty() {
        return Ok(KernelArguments::new());
    }
    let value: serde_json::Value = serde_json::from_str(&call.arguments)
        .map_err(|e| argument_error(format!("invalid JSON: {e}")))?;
    Ok(KernelArguments::from_json(value)
        .ok_or_else(|| argument_error("expected a JSON object".into()))?)
}

/// Resolves at `deadline`, or never without one.
async fn expire(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn stream_timeout(settings: &ExecutionSettings) -> Error {
    Error::Backend(BackendError::Timeout {
        timeout_secs: settings.timeout().map(|t| t.as_secs()).unwrap_or_default(),
    })
}

fn as_execution_error(function: &str, error: Error) -> Error {
    match error {
        Error::Function(FunctionError::Execution { .. }) => error,
        other => FunctionError::execution(function, other).into(),
    }
}

fn merge_usage(total: Option<Usage>, next: Option<Usage>) -> Option<Usage> {
    match (total, next) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, Next};
    use crate::test_helpers::{SequentialMockBackend, make_text_response, make_tool_call_response};
    use rustedkernel_core::error::BoxError;
    use rustedkernel_core::function::{ParameterSpec, ParameterType};
    use rustedkernel_core::message::ChatRole;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn weather_plugin(calls: Arc<AtomicUsize>) -> Plugin {
        Plugin::from_functions(
            "Weather",
            "Weather lookups",
            [
                KernelFunction::from_fn(
                    "Forecast",
                    "Forecast for a city",
                    vec![ParameterSpec::required("city", ParameterType::String, "City name")],
                    move |args| {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            let city = args.get_str("city").unwrap_or_default().to_string();
                            Ok::<_, BoxError>(json!(format!("Sunny in {city}")))
                        }
                    },
                ),
                KernelFunction::from_fn("Broken", "Always fails", vec![], |_| async move {
                    Err::<serde_json::Value, BoxError>("sensor offline".into())
                }),
            ],
        )
        .unwrap()
    }

    fn kernel(backend: Arc<SequentialMockBackend>) -> (Kernel, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let kernel = Kernel::builder()
            .with_plugin(weather_plugin(Arc::clone(&calls)))
            .with_backend(backend)
            .build()
            .unwrap();
        (kernel, calls)
    }

    fn history(text: &str) -> ChatHistory {
        let mut history = ChatHistory::with_system_message("You are helpful.");
        history.add_user_message(text);
        history
    }

    #[tokio::test]
    async fn invoke_prompt_sends_rendered_prompt() {
        let backend = Arc::new(SequentialMockBackend::new(vec![make_text_response("Woof")]));
        let (kernel, _) = kernel(Arc::clone(&backend));

        let result = kernel
            .invoke_prompt(
                "Tell me about {{topic}}",
                &KernelArguments::new().with("topic", "Dogs"),
                &ExecutionSettings::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.rendered_prompt, "Tell me about Dogs");
        assert_eq!(result.content, "Woof");
        assert_eq!(result.rounds, 1);
        let sent = &backend.requests()[0];
        assert_eq!(sent.messages.len(), 1);
        assert_eq!(sent.messages[0].role, ChatRole::User);
        assert_eq!(sent.messages[0].content, "Tell me about Dogs");
        assert_eq!(sent.tools.len(), 2);
        assert_eq!(sent.tools[0].name, "Weather-Forecast");
    }

    #[tokio::test]
    async fn tool_calls_are_resolved_and_redispatched() {
        let backend = Arc::new(SequentialMockBackend::new(vec![
            make_tool_call_response(&[("call_1", "Weather-Forecast", r#"{"city":"Oslo"}"#)]),
            make_text_response("It is sunny in Oslo."),
        ]));
        let (kernel, calls) = kernel(Arc::clone(&backend));
        let mut history = history("Weather in Oslo?");

        let reply = kernel
            .invoke_chat_appending(&mut history, &ExecutionSettings::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.content, "It is sunny in Oslo.");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.call_count(), 2);

        // system, user, assistant(tool call), tool, assistant
        let roles: Vec<_> = history.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant]
        );
        let tool_msg = &history.messages()[3];
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_msg.content, "Sunny in Oslo");

        let second = &backend.requests()[1];
        assert_eq!(second.messages.len(), 4);
    }

    #[tokio::test]
    async fn invoke_chat_leaves_history_alone() {
        let backend = Arc::new(SequentialMockBackend::new(vec![make_text_response("Hi!")]));
        let (kernel, _) = kernel(backend);
        let history = history("Hello");
        let reply = kernel
            .invoke_chat(&history, &ExecutionSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "Hi!");
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn empty_history_is_rejected() {
        let backend = Arc::new(SequentialMockBackend::new(vec![]));
        let (kernel, _) = kernel(Arc::clone(&backend));
        let err = kernel
            .invoke_chat(&ChatHistory::new(), &ExecutionSettings::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHistory(_)));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn round_cap_is_enforced() {
        let looping = (0..5)
            .map(|i| {
                let id = format!("call_{i}");
                make_tool_call_response(&[(id.as_str(), "Weather-Forecast", r#"{"city":"Rome"}"#)])
            })
            .collect();
        let backend = Arc::new(SequentialMockBackend::new(looping));
        let (kernel, calls) = kernel(Arc::clone(&backend));

        let err = kernel
            .invoke_chat(
                &history("loop forever"),
                &ExecutionSettings::default().with_max_tool_rounds(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ToolCallLoopExceeded { max_rounds: 2 }));
        assert_eq!(backend.call_count(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn function_choice_none_offers_and_runs_nothing() {
        let backend = Arc::new(SequentialMockBackend::new(vec![make_tool_call_response(&[(
            "call_1",
            "Weather-Forecast",
            r#"{"city":"Oslo"}"#,
        )])]));
        let (kernel, calls) = kernel(Arc::clone(&backend));

        let reply = kernel
            .invoke_chat(
                &history("Weather?"),
                &ExecutionSettings::default().with_function_choice(FunctionChoiceBehavior::None),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!reply.has_tool_calls());
        assert!(backend.requests()[0].tools.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_message() {
        let backend = Arc::new(SequentialMockBackend::new(vec![
            make_tool_call_response(&[
                ("call_1", "Weather-Broken", ""),
                ("call_2", "Weather-Forecast", r#"{"city":"Lima"}"#),
                ("call_3", "Weather-Forecast", "not json"),
            ]),
            make_text_response("Partial answer"),
        ]));
        let (kernel, calls) = kernel(Arc::clone(&backend));

        let reply = kernel
            .invoke_chat(&history("Weather?"), &ExecutionSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.content, "Partial answer");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let sent = &backend.requests()[1].messages;
        let tool_messages: Vec<_> = sent.iter().filter(|m| m.role == ChatRole::Tool).collect();
        assert_eq!(tool_messages.len(), 3);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_messages[0].content.contains("sensor offline"));
        assert_eq!(tool_messages[0].metadata["error"], json!(true));
        assert_eq!(tool_messages[1].content, "Sunny in Lima");
        assert!(tool_messages[2].content.contains("invalid JSON"));
    }

    #[tokio::test]
    async fn abort_policy_fails_the_round() {
        let backend = Arc::new(SequentialMockBackend::new(vec![
            make_tool_call_response(&[("call_1", "Weather-Broken", "{}")]),
            make_text_response("never sent"),
        ]));
        let (kernel, _) = kernel(Arc::clone(&backend));

        let err = kernel
            .invoke_chat(
                &history("Weather?"),
                &ExecutionSettings::default().with_tool_failure(ToolFailurePolicy::Abort),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::Function(FunctionError::Execution { function, .. }) => {
                assert_eq!(function, "Weather.Broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn atomic_backend_forces_abort() {
        let backend = Arc::new(
            SequentialMockBackend::new(vec![make_tool_call_response(&[("call_1", "Nope-Missing", "{}")])])
                .with_atomic_tool_results(),
        );
        let (kernel, _) = kernel(Arc::clone(&backend));

        let err = kernel
            .invoke_chat(&history("x"), &ExecutionSettings::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Function(FunctionError::Execution { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_timeout_is_a_backend_error() {
        let backend = Arc::new(
            SequentialMockBackend::new(vec![make_text_response("late")])
                .with_delay(Duration::from_secs(30)),
        );
        let (kernel, _) = kernel(backend);

        let err = kernel
            .invoke_chat(
                &history("hurry"),
                &ExecutionSettings::default().with_timeout(Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(BackendError::Timeout { timeout_secs: 5 })));
    }

    #[tokio::test]
    async fn cancelled_before_dispatch() {
        let backend = Arc::new(SequentialMockBackend::new(vec![make_text_response("no")]));
        let (kernel, _) = kernel(backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = kernel
            .invoke_chat(&history("x"), &ExecutionSettings::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn backend_errors_surface_uninterpreted() {
        let backend = Arc::new(SequentialMockBackend::new(vec![]));
        let (kernel, _) = kernel(Arc::clone(&backend));
        let err = kernel
            .invoke_chat(&history("x"), &ExecutionSettings::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(BackendError::InvalidResponse(_))));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn prompt_function_renders_and_dispatches() {
        let backend = Arc::new(SequentialMockBackend::new(vec![make_text_response("A short poem")]));
        let poem = KernelFunction::prompt(
            "Poem",
            "Writes a poem",
            PromptFunction::new("Write a {{style}} about {{topic}}")
                .with_input_variable(InputVariable::new("topic"))
                .with_input_variable(InputVariable::new("style").with_default("haiku")),
        );
        let kernel = Kernel::builder()
            .with_plugin(Plugin::from_functions("Writer", "", [poem]).unwrap())
            .with_backend(backend.clone())
            .build()
            .unwrap();

        let result = kernel
            .invoke_function(
                "Writer.Poem",
                KernelArguments::new().with("topic", "rain"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.as_text(), "A short poem");
        assert_eq!(backend.requests()[0].messages[0].content, "Write a haiku about rain");
    }

    #[tokio::test]
    async fn duplicate_plugins_fail_the_build() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = Kernel::builder()
            .with_plugin(weather_plugin(Arc::clone(&calls)))
            .with_plugin(weather_plugin(calls))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Function(FunctionError::DuplicateName(_))));
    }

    struct Shout;

    #[async_trait]
    impl Filter<FunctionInvocationContext> for Shout {
        fn name(&self) -> &str {
            "shout"
        }

        async fn intercept(
            &self,
            context: &mut FunctionInvocationContext,
            next: Next<'_, FunctionInvocationContext>,
        ) -> Result<()> {
            next.run(context).await?;
            if let Some(result) = context.result.as_mut() {
                result.value = json!(result.as_text().to_uppercase());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn function_filters_wrap_invocations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let kernel = Kernel::builder()
            .with_plugin(weather_plugin(calls))
            .with_function_filter(Arc::new(Shout))
            .build()
            .unwrap();

        let result = kernel
            .invoke_function(
                "Weather-Forecast",
                KernelArguments::new().with("city", "Paris"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.as_text(), "SUNNY IN PARIS");
    }

    #[tokio::test]
    async fn events_are_published() {
        let backend = Arc::new(SequentialMockBackend::new(vec![
            make_tool_call_response(&[("call_1", "Weather-Forecast", r#"{"city":"Oslo"}"#)]),
            make_text_response("done"),
        ]));
        let (kernel, _) = kernel(backend);
        let mut events = kernel.subscribe();

        kernel
            .invoke_prompt(
                "Weather?",
                &KernelArguments::new(),
                &ExecutionSettings::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(match event.as_ref() {
                KernelEvent::PromptRendered { .. } => "rendered",
                KernelEvent::FunctionInvoked { .. } => "invoked",
                KernelEvent::ResponseGenerated { .. } => "response",
                KernelEvent::MemoryUpserted { .. } => "upserted",
                KernelEvent::ErrorOccurred { .. } => "error",
            });
        }
        assert_eq!(seen, ["rendered", "response", "invoked", "response"]);
    }

    #[tokio::test]
    async fn stream_resolves_tool_calls_between_rounds() {
        use rustedkernel_core::backend::StreamChunk;

        let tool_round = vec![StreamChunk {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: "call_1".into(),
                name: "Weather-Forecast".into(),
                arguments: r#"{"city":"Oslo"}"#.into(),
            }],
            done: true,
            usage: None,
        }];
        let answer_round = vec![
            StreamChunk::delta("Sunny "),
            StreamChunk::delta("today"),
            StreamChunk {
                done: true,
                ..StreamChunk::default()
            },
        ];
        let backend = Arc::new(SequentialMockBackend::new(vec![]).with_streams(vec![tool_round, answer_round]));
        let (kernel, calls) = kernel(Arc::clone(&backend));

        let mut stream = kernel.stream_chat(&history("Weather?"), &ExecutionSettings::default(), &CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event.unwrap());
        }

        let kinds: Vec<_> = events.iter().map(StreamEvent::event_type).collect();
        assert_eq!(kinds, ["tool_call", "tool_result", "content", "content", "done"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match events.last().unwrap() {
            StreamEvent::Done { content, rounds, .. } => {
                assert_eq!(content, "Sunny today");
                assert_eq!(*rounds, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(backend.requests().iter().all(|r| r.stream));
    }

    #[tokio::test]
    async fn memory_operations_need_a_store() {
        let backend = Arc::new(SequentialMockBackend::new(vec![]));
        let (kernel, _) = kernel(backend);
        let err = kernel
            .save_texts("notes", vec![TextEntry::new("hello")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn save_and_search_texts() {
        let backend = Arc::new(SequentialMockBackend::new(vec![]));
        let store = Arc::new(InMemoryVectorStore::new());
        let kernel = Kernel::builder()
            .with_backend(backend)
            .with_memory(store.clone())
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let keys = kernel
            .save_texts(
                "notes",
                vec![
                    TextEntry::new("a").with_key("short"),
                    TextEntry::new("a much longer sentence").with_key("long"),
                ],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(keys, ["short", "long"]);
        assert_eq!(store.count("notes").await.unwrap(), 2);

        let hits = kernel
            .search_text("notes", "a much longer sentence", Some(1), &cancel)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.key, "long");
    }

    #[tokio::test]
    async fn open_store_follows_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = MemoryConfig {
            backend: MemoryBackendKind::JsonFile,
            path: Some(tmp.path().to_path_buf()),
            ..MemoryConfig::default()
        };
        assert_eq!(open_store(&config).await.unwrap().name(), "json_file");
        assert_eq!(open_store(&MemoryConfig::default()).await.unwrap().name(), "in_memory");
    }
}
