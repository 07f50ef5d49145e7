//! Request orchestrator
//!
//! Drives one completion through RECEIVED → DISPATCHED → STREAMING →
//! COMPLETED | FAILED. Each connection owns a single worker task, so
//! completions on one socket run strictly one after another and their
//! chunks never interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use tether_core::config::GatewayConfig;
use tether_core::providers::ChunkSink;
use tether_core::{
    CompletionRequest, CompletionResult, LlmProvider, ProviderError, ProviderOutput,
    ProviderRouter, TokenUsage, UsageMeter,
};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::ServerMessage;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const RETRY_JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for one provider call, retries excluded
    pub provider_timeout: Duration,
    /// Requests allowed to wait behind the one in flight
    pub max_queued: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default())
    }
}

impl OrchestratorConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            provider_timeout: config.provider_timeout(),
            max_queued: config.max_queued_requests,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: MAX_RETRY_DELAY,
        }
    }
}

/// Delay before retry `attempt` (0-indexed): `min(base * 2^n, max)` plus up
/// to 20% jitter, and never shorter than the backend's own hint.
pub fn compute_delay(
    config: &OrchestratorConfig,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let base_ms = config.retry_base_delay.as_millis() as u64;
    let capped_ms = base_ms
        .saturating_mul(exp)
        .min(config.retry_max_delay.as_millis() as u64);
    let jitter_max_ms = (capped_ms as f64 * RETRY_JITTER_FRACTION) as u64;
    let jitter_ms = if jitter_max_ms > 0 {
        rand::random_range(0..=jitter_max_ms)
    } else {
        0
    };
    let backoff = Duration::from_millis(capped_ms + jitter_ms);
    match retry_after {
        Some(hint) => backoff.max(hint.min(config.retry_max_delay)),
        None => backoff,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Dispatched,
    Streaming,
    Completed,
    Failed,
}

/// Phase tracker for one request; every transition is logged.
struct RequestRun<'a> {
    connection_id: &'a str,
    request_id: &'a str,
    phase: RequestPhase,
    started: Instant,
}

impl<'a> RequestRun<'a> {
    fn new(connection_id: &'a str, request_id: &'a str) -> Self {
        debug!(
            connection_id = connection_id,
            request_id = request_id,
            "Request received"
        );
        Self {
            connection_id,
            request_id,
            phase: RequestPhase::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RequestPhase) {
        debug!(
            connection_id = self.connection_id,
            request_id = self.request_id,
            from = ?self.phase,
            to = ?next,
            "Request phase"
        );
        self.phase = next;
        if matches!(next, RequestPhase::Completed | RequestPhase::Failed) {
            info!(
                connection_id = self.connection_id,
                request_id = self.request_id,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Request {:?}",
                next
            );
        }
    }
}

struct Job {
    request_id: String,
    request: CompletionRequest,
}

/// Per-connection FIFO in front of the connection's worker task
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
    outstanding: Arc<AtomicUsize>,
    limit: usize,
}

impl RequestQueue {
    /// Enqueue a completion, or refuse it with `Busy` when one is in flight
    /// and the queue is full.
    pub fn submit(&self, request_id: String, request: CompletionRequest) -> GatewayResult<()> {
        let limit = self.limit;
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|n| GatewayError::Busy(n.saturating_sub(1)))?;
        self.tx.send(Job { request_id, request }).map_err(|_| {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            GatewayError::Internal("connection worker has stopped".into())
        })
    }

    /// Requests in flight or waiting.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    router: Arc<ProviderRouter>,
    meter: Arc<UsageMeter>,
    registry: Arc<ConnectionRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        router: Arc<ProviderRouter>,
        meter: Arc<UsageMeter>,
        registry: Arc<ConnectionRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            router,
            meter,
            registry,
            config,
        }
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    /// Start the worker that serves `handle`'s completions in order. The
    /// worker stops when the connection closes; queued requests are dropped.
    pub fn spawn_worker(self: &Arc<Self>, handle: ConnectionHandle) -> RequestQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let counter = outstanding.clone();
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = handle.cancel_token().cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                orchestrator
                    .execute(&handle, &job.request_id, job.request)
                    .await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("Request worker for '{}' stopped", handle.id());
        });

        RequestQueue {
            tx,
            outstanding,
            limit: 1 + self.config.max_queued,
        }
    }

    /// Run a completion and send its terminal frame (`result` or `error`).
    pub async fn execute(
        &self,
        handle: &ConnectionHandle,
        request_id: &str,
        request: CompletionRequest,
    ) {
        match self.complete(handle, request_id, request).await {
            Ok(Some(result)) => {
                handle.send(ServerMessage::Result {
                    request_id: request_id.to_string(),
                    result,
                });
            }
            Ok(None) => {
                debug!(
                    request_id = request_id,
                    "Connection '{}' closed, result discarded",
                    handle.id()
                );
            }
            Err(err) => {
                warn!(
                    connection_id = handle.id(),
                    request_id = request_id,
                    kind = err.kind(),
                    "Request failed: {}",
                    err
                );
                handle.send(ServerMessage::error(Some(request_id.to_string()), &err));
            }
        }
    }

    /// Run a completion to its end. `Ok(None)` means the connection closed
    /// first and nothing should be sent.
    pub async fn complete(
        &self,
        handle: &ConnectionHandle,
        request_id: &str,
        request: CompletionRequest,
    ) -> GatewayResult<Option<CompletionResult>> {
        let mut run = RequestRun::new(handle.id(), request_id);

        let user_id = self.registry.authenticated_user(handle.id()).ok_or_else(|| {
            GatewayError::Unauthorized("connection has not completed authentication".into())
        })?;
        request.validate().map_err(GatewayError::InvalidRequest)?;
        let (provider, request) = self.router.resolve(&request)?;
        self.meter.preflight(&user_id).await?;

        run.advance(RequestPhase::Dispatched);
        debug!(
            request_id = request_id,
            provider = %request.provider,
            model = %request.model,
            streaming = request.streaming,
            "Dispatching"
        );

        let mut streamed = String::new();
        let mut attempt = 0u32;
        let outcome = loop {
            let result = {
                let mut sink = |chunk: &str| {
                    if chunk.is_empty() || handle.is_closed() {
                        return;
                    }
                    if run.phase != RequestPhase::Streaming {
                        run.advance(RequestPhase::Streaming);
                    }
                    streamed.push_str(chunk);
                    handle.send(ServerMessage::Chunk {
                        request_id: request_id.to_string(),
                        text: chunk.to_string(),
                    });
                };
                tokio::select! {
                    biased;
                    _ = handle.cancel_token().cancelled() => None,
                    result = self.attempt(provider.as_ref(), &request, &mut sink) => Some(result),
                }
            };

            match result {
                Some(Err(err))
                    if err.is_retryable()
                        && streamed.is_empty()
                        && attempt < self.config.max_retries =>
                {
                    let delay = compute_delay(&self.config, attempt, err.retry_after());
                    attempt += 1;
                    warn!(
                        request_id = request_id,
                        provider = %request.provider,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after {}",
                        err
                    );
                    tokio::select! {
                        biased;
                        _ = handle.cancel_token().cancelled() => break None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => break other,
            }
        };

        match outcome {
            Some(Ok(output)) => {
                let text = if request.streaming {
                    streamed
                } else {
                    output.text
                };
                let tokens_used = output.usage.total();
                let credits_used = self.meter.credits_for(tokens_used);
                let truncated = output.stop_reason.is_truncated();
                if truncated {
                    warn!(
                        connection_id = handle.id(),
                        request_id = request_id,
                        "Output stopped at the model's token limit"
                    );
                }
                self.bill(&user_id, &request, tokens_used, credits_used).await;
                run.advance(RequestPhase::Completed);
                if handle.is_closed() {
                    return Ok(None);
                }
                Ok(Some(CompletionResult {
                    text,
                    tokens_used,
                    credits_used,
                    tool_call: output.tool_call,
                    truncated,
                }))
            }
            Some(Err(err)) => {
                run.advance(RequestPhase::Failed);
                self.bill_partial(&user_id, &request, &streamed).await;
                Err(err.into())
            }
            None => {
                run.advance(RequestPhase::Failed);
                self.bill_partial(&user_id, &request, &streamed).await;
                Ok(None)
            }
        }
    }

    /// One provider call under the per-call deadline.
    async fn attempt(
        &self,
        provider: &dyn LlmProvider,
        request: &CompletionRequest,
        sink: ChunkSink<'_>,
    ) -> Result<ProviderOutput, ProviderError> {
        let call = async {
            if request.streaming {
                provider.stream_completion(request, sink).await
            } else {
                provider.send_completion(request).await
            }
        };
        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.provider_timeout)),
        }
    }

    async fn bill(&self, user_id: &str, request: &CompletionRequest, tokens: u64, credits: f64) {
        if let Err(e) = self
            .meter
            .record_and_deduct(user_id, &request.provider, &request.model, tokens, credits)
            .await
        {
            error!(
                user_id = user_id,
                tokens = tokens,
                "Failed to meter completed request: {}",
                e
            );
        }
    }

    /// Charge for what was streamed before a failure or disconnect.
    async fn bill_partial(&self, user_id: &str, request: &CompletionRequest, streamed: &str) {
        if streamed.is_empty() {
            return;
        }
        let usage = TokenUsage::estimate(request, streamed);
        let tokens = usage.total();
        self.bill(user_id, request, tokens, self.meter.credits_for(tokens))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tether_core::providers::echo::ECHO_MODELS;
    use tether_core::providers::{ChatMessage, ModelTable, StopReason, ToolCall};
    use tether_core::{AccountStore, CreditRate, MemoryLedger, ProviderResult, UserIdentity};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Replays scripted outcomes, one per call
    struct Scripted {
        outcomes: Mutex<Vec<ProviderResult<ProviderOutput>>>,
        chunks: Vec<&'static str>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(outcomes: Vec<ProviderResult<ProviderOutput>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                chunks: Vec::new(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn output(text: &str, input: u64, output_tokens: u64) -> ProviderOutput {
        ProviderOutput {
            text: text.to_string(),
            usage: TokenUsage::exact(input, output_tokens),
            tool_call: None,
            stop_reason: StopReason::EndTurn,
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn provider_name(&self) -> &str {
            "echo"
        }

        fn models(&self) -> &ModelTable {
            &ECHO_MODELS
        }

        fn default_model(&self) -> &str {
            "echo-1"
        }

        async fn send_completion(
            &self,
            _request: &CompletionRequest,
        ) -> ProviderResult<ProviderOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(ProviderError::MalformedResponse("script exhausted".into()));
            }
            outcomes.remove(0)
        }

        async fn stream_completion(
            &self,
            request: &CompletionRequest,
            on_chunk: ChunkSink<'_>,
        ) -> ProviderResult<ProviderOutput> {
            for chunk in &self.chunks {
                on_chunk(chunk);
            }
            self.send_completion(request).await
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<MemoryLedger>,
    }

    async fn fixture(provider: Arc<Scripted>, credits: f64) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
        ));
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_user(UserIdentity::new("user-42", "a@example.com", credits))
            .await;
        let meter = Arc::new(UsageMeter::new(ledger.clone(), CreditRate::default()));
        let router = Arc::new(ProviderRouter::new().with(provider));
        let config = OrchestratorConfig {
            provider_timeout: Duration::from_millis(200),
            max_queued: 1,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(20),
        };
        Fixture {
            orchestrator: Arc::new(Orchestrator::new(router, meter, registry.clone(), config)),
            registry,
            ledger,
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
        authenticated: bool,
    ) -> (ConnectionHandle, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = registry.register("c-1", tx).unwrap();
        if authenticated {
            assert!(registry.authenticate("c-1", "user-42"));
        }
        (handle, rx)
    }

    fn request(streaming: bool) -> CompletionRequest {
        CompletionRequest {
            provider: "echo".into(),
            model: String::new(),
            messages: vec![ChatMessage::user("Hello, world!")],
            temperature: Some(0.7),
            tools: Vec::new(),
            streaming,
        }
    }

    #[test]
    fn test_compute_delay() {
        let config = OrchestratorConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(1),
            ..OrchestratorConfig::default()
        };
        let d0 = compute_delay(&config, 0, None);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(120));
        let d2 = compute_delay(&config, 2, None);
        assert!(d2 >= Duration::from_millis(400) && d2 <= Duration::from_millis(480));
        let capped = compute_delay(&config, 10, None);
        assert!(capped <= Duration::from_millis(1200));
        assert_eq!(
            compute_delay(&config, 0, Some(Duration::from_millis(900))),
            Duration::from_millis(900)
        );
    }

    #[tokio::test]
    async fn test_unauthenticated_never_dispatches() {
        let provider = Arc::new(Scripted::new(vec![Ok(output("hi", 1, 1))]));
        let fx = fixture(provider.clone(), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, false);

        let err = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_completion_is_metered() {
        let provider = Arc::new(Scripted::new(vec![Ok(output("Hello!", 600, 400))]));
        let fx = fixture(provider, 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let result = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.text, "Hello!");
        assert_eq!(result.tokens_used, 1000);
        assert_eq!(result.credits_used, 1.0);

        let log = fx.ledger.usage_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].user_id, "user-42");
        assert_eq!(log[0].model, "echo-1");
        let user = fx.ledger.fetch_user("user-42").await.unwrap().unwrap();
        assert_eq!(user.credits_remaining, 9.0);
    }

    #[tokio::test]
    async fn test_streamed_text_is_chunk_concatenation() {
        let mut scripted = Scripted::new(vec![Ok(output("Hello, world!", 4, 4))]);
        scripted.chunks = vec!["Hel", "lo, ", "world!"];
        let fx = fixture(Arc::new(scripted), 10.0).await;
        let (handle, mut rx) = connect(&fx.registry, true);

        fx.orchestrator.execute(&handle, "r-1", request(true)).await;

        let mut chunks = String::new();
        let mut result = None;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                ServerMessage::Chunk { request_id, text } => {
                    assert_eq!(request_id, "r-1");
                    chunks.push_str(&text);
                }
                ServerMessage::Result { result: r, .. } => result = Some(r),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(result.unwrap().text, chunks);
        assert_eq!(chunks, "Hello, world!");
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let provider = Arc::new(Scripted::new(vec![
            Err(ProviderError::Transport("reset".into())),
            Err(ProviderError::RateLimited { retry_after_ms: 5 }),
            Ok(output("third time", 3, 3)),
        ]));
        let fx = fixture(provider.clone(), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let result = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.text, "third time");
        assert_eq!(provider.calls(), 3);
        assert_eq!(fx.ledger.usage_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(Scripted::new(vec![
            Err(ProviderError::Transport("a".into())),
            Err(ProviderError::Transport("b".into())),
            Err(ProviderError::Transport("c".into())),
            Ok(output("never", 1, 1)),
        ]));
        let fx = fixture(provider.clone(), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let err = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderTransportError");
        assert_eq!(provider.calls(), 3);
        assert!(fx.ledger.usage_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_response_is_terminal() {
        let provider = Arc::new(Scripted::new(vec![
            Err(ProviderError::MalformedResponse("not json".into())),
            Ok(output("unused", 1, 1)),
        ]));
        let fx = fixture(provider.clone(), 10.0).await;
        let (handle, mut rx) = connect(&fx.registry, true);

        fx.orchestrator.execute(&handle, "r-1", request(false)).await;
        assert_eq!(provider.calls(), 1);
        match rx.try_recv().unwrap() {
            ServerMessage::Error {
                request_id, kind, ..
            } => {
                assert_eq!(request_id.as_deref(), Some("r-1"));
                assert_eq!(kind, "ProviderMalformedResponse");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_after_chunks_bills_partial_and_does_not_retry() {
        let mut scripted = Scripted::new(vec![
            Err(ProviderError::Transport("stream cut".into())),
            Ok(output("unused", 1, 1)),
        ]);
        scripted.chunks = vec!["partial answer"];
        let provider = Arc::new(scripted);
        let fx = fixture(provider.clone(), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let err = fx
            .orchestrator
            .complete(&handle, "r-1", request(true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderTransportError");
        assert_eq!(provider.calls(), 1);
        let log = fx.ledger.usage_log().await;
        assert_eq!(log.len(), 1);
        assert!(log[0].tokens_used > 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut scripted = Scripted::new(vec![Ok(output("late", 1, 1))]);
        scripted.delay = Duration::from_secs(5);
        let fx = fixture(Arc::new(scripted), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let err = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderTimeout");
    }

    #[tokio::test]
    async fn test_insufficient_credits() {
        let provider = Arc::new(Scripted::new(vec![Ok(output("hi", 1, 1))]));
        let fx = fixture(provider.clone(), 0.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let err = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InsufficientCredits");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_and_invalid_request() {
        let provider = Arc::new(Scripted::new(Vec::new()));
        let fx = fixture(provider, 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let mut req = request(false);
        req.provider = "mistral".into();
        let err = fx.orchestrator.complete(&handle, "r-1", req).await.unwrap_err();
        assert_eq!(err.kind(), "UnknownProvider");

        let mut req = request(false);
        req.messages.clear();
        let err = fx.orchestrator.complete(&handle, "r-2", req).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn test_tool_call_surfaces_in_result() {
        let mut out = output("", 10, 5);
        out.tool_call = Some(ToolCall::new(None, "lookup", serde_json::json!({"q": "rust"})));
        out.stop_reason = StopReason::ToolUse;
        let fx = fixture(Arc::new(Scripted::new(vec![Ok(out)])), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let result = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap()
            .unwrap();
        let call = result.tool_call.unwrap();
        assert_eq!(call.name, "lookup");
        assert!(call.id.starts_with("call_"));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_max_tokens_marks_result_truncated() {
        let mut out = output("cut sh", 10, 5);
        out.stop_reason = StopReason::MaxTokens;
        let fx = fixture(Arc::new(Scripted::new(vec![Ok(out)])), 10.0).await;
        let (handle, _rx) = connect(&fx.registry, true);

        let result = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap()
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.text, "cut sh");
        assert_eq!(result.tokens_used, 15);
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_call() {
        let mut scripted = Scripted::new(vec![Ok(output("late", 1, 1))]);
        scripted.delay = Duration::from_millis(150);
        let fx = fixture(Arc::new(scripted), 10.0).await;
        let (handle, mut rx) = connect(&fx.registry, true);

        let registry = fx.registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.unregister("c-1");
        });
        let outcome = fx
            .orchestrator
            .complete(&handle, "r-1", request(false))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(rx.try_recv().is_err());
        assert!(fx.ledger.usage_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_rejects_when_full() {
        let mut scripted = Scripted::new(vec![
            Ok(output("one", 1, 1)),
            Ok(output("two", 1, 1)),
        ]);
        scripted.delay = Duration::from_millis(50);
        let fx = fixture(Arc::new(scripted), 10.0).await;
        let (handle, mut rx) = connect(&fx.registry, true);
        let queue = fx.orchestrator.spawn_worker(handle);

        queue.submit("r-1".into(), request(false)).unwrap();
        queue.submit("r-2".into(), request(false)).unwrap();
        assert!(matches!(
            queue.submit("r-3".into(), request(false)),
            Err(GatewayError::Busy(1))
        ));

        let mut order = Vec::new();
        while order.len() < 2 {
            match rx.recv().await.unwrap() {
                ServerMessage::Result { request_id, result } => {
                    order.push((request_id, result.text))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            order,
            vec![("r-1".to_string(), "one".to_string()), ("r-2".to_string(), "two".to_string())]
        );
    }
}
