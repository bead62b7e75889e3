//! Conversation engine: owns the history and keeps it consistent across
//! failed, empty and cancelled calls.

use crate::context::ContextProvider;
use crate::error::ChatError;
use crate::provider::{ChatRequest, Provider, Turn};
use std::future::Future;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

pub type SharedProvider = Arc<dyn Provider + Send + Sync>;
pub type SharedContext = Arc<dyn ContextProvider + Send + Sync>;

/// Outcome of a call that reached the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// The call succeeded but carried no text.
    Empty,
}

impl Reply {
    fn from_text(text: Option<String>) -> Self {
        match text {
            Some(t) if !t.is_empty() => Reply::Text(t),
            _ => Reply::Empty,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Reply::Text(t) => Some(t),
            Reply::Empty => None,
        }
    }
}

pub struct Conversation {
    provider: SharedProvider,
    context: SharedContext,
    history: Vec<Turn>,
}

impl Conversation {
    pub fn new(provider: SharedProvider, context: SharedContext) -> Self {
        Self {
            provider,
            context,
            history: Vec::new(),
        }
    }

    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Completed exchanges in the history.
    pub fn depth(&self) -> usize {
        self.history.len() / 2
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Ask a one-off question; the history is neither sent nor changed.
    pub async fn send_single_turn(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Reply, ChatError> {
        validate(model, prompt)?;
        let req = build_request(self.context.as_ref(), model, &[Turn::user(prompt)]);
        let text = until_cancelled(cancel, self.provider.generate(req)).await??;
        Ok(Reply::from_text(text))
    }

    /// Streaming variant of [`Conversation::send_single_turn`].
    pub async fn stream_single_turn<F>(
        &self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
        on_delta: F,
    ) -> Result<Reply, ChatError>
    where
        F: FnMut(&str),
    {
        validate(model, prompt)?;
        let req = build_request(self.context.as_ref(), model, &[Turn::user(prompt)]);
        let text = collect_stream(self.provider.as_ref(), req, cancel, on_delta).await?;
        Ok(Reply::from_text(Some(text)))
    }

    /// Send `prompt` with the whole history and wait for the full answer.
    ///
    /// On `Reply::Text` the history grows by exactly one user and one model
    /// turn. On `Reply::Empty`, on error and on cancellation it is left as it
    /// was before the call.
    pub async fn send(
        &mut self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Reply, ChatError> {
        validate(model, prompt)?;

        let pending = PendingTurn::begin(&mut self.history, Turn::user(prompt));
        let req = build_request(self.context.as_ref(), model, pending.history());
        let text = until_cancelled(cancel, self.provider.generate(req)).await??;

        Ok(pending.finish(text))
    }

    /// Like [`Conversation::send`], but streams the answer, handing every
    /// delta to `on_delta` in arrival order before it is committed.
    pub async fn send_streaming<F>(
        &mut self,
        model: &str,
        prompt: &str,
        cancel: &CancellationToken,
        on_delta: F,
    ) -> Result<Reply, ChatError>
    where
        F: FnMut(&str),
    {
        validate(model, prompt)?;

        let pending = PendingTurn::begin(&mut self.history, Turn::user(prompt));
        let req = build_request(self.context.as_ref(), model, pending.history());
        let text = collect_stream(self.provider.as_ref(), req, cancel, on_delta).await?;

        tracing::info!(model, chars = text.len(), "completed streaming");
        Ok(pending.finish(Some(text)))
    }
}

fn validate(model: &str, prompt: &str) -> Result<(), ChatError> {
    if model.trim().is_empty() {
        return Err(ChatError::validation("model id must not be empty"));
    }
    if model.contains(|c: char| c.is_whitespace() || matches!(c, '/' | '?' | '#')) {
        return Err(ChatError::validation(format!("invalid model id: {model:?}")));
    }
    if prompt.trim().is_empty() {
        return Err(ChatError::validation("prompt must not be empty"));
    }
    Ok(())
}

fn build_request(context: &dyn ContextProvider, model: &str, history: &[Turn]) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        contents: history.to_vec(),
        system_instruction: context.system_instruction(),
    }
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, ChatError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::cancelled()),
        out = fut => Ok(out),
    }
}

async fn collect_stream<F>(
    provider: &(dyn Provider + Send + Sync),
    req: ChatRequest,
    cancel: &CancellationToken,
    mut on_delta: F,
) -> Result<String, ChatError>
where
    F: FnMut(&str),
{
    let mut stream = until_cancelled(cancel, provider.stream_chat(req)).await??;
    let mut full = String::new();

    while let Some(item) = until_cancelled(cancel, stream.next()).await? {
        let chunk = item?;
        on_delta(&chunk.text);
        full.push_str(&chunk.text);
    }

    Ok(full)
}

/// A user turn appended ahead of the answer it waits for.
///
/// Unless committed, dropping it truncates the history back to where it
/// stood before `begin`, whatever the exit path (error, cancellation, or the
/// caller dropping the future). Removal is by position, so an identical
/// earlier prompt is never touched.
struct PendingTurn<'a> {
    history: &'a mut Vec<Turn>,
    mark: usize,
    committed: bool,
}

impl<'a> PendingTurn<'a> {
    fn begin(history: &'a mut Vec<Turn>, turn: Turn) -> Self {
        let mark = history.len();
        history.push(turn);
        Self {
            history,
            mark,
            committed: false,
        }
    }

    fn history(&self) -> &[Turn] {
        self.history.as_slice()
    }

    /// Commit the answer, or discard the user turn if there is none.
    fn finish(mut self, text: Option<String>) -> Reply {
        let reply = Reply::from_text(text);
        if let Reply::Text(t) = &reply {
            self.history.push(Turn::model(t.clone()));
            self.committed = true;
        } else {
            tracing::info!("model returned no content; dropping the pending prompt");
        }
        reply
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.history.truncate(self.mark);
            tracing::debug!(turns = self.history.len(), "rolled back pending user turn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorKind;
    use crate::provider::{ChatChunk, ChunkStream, ModelInfo, Role};
    use futures_core::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    enum Scripted {
        Buffered(Result<Option<String>, ChatError>),
        Refuse(ChatError),
        Stream(Vec<Result<&'static str, ChatError>>),
        /// Deltas, then a body that never ends.
        Stall(Vec<&'static str>),
    }

    #[derive(Default)]
    struct FakeProvider {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<ChatRequest>>,
    }

    impl FakeProvider {
        fn with(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<ChatRequest> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self, req: ChatRequest) -> Scripted {
            self.calls.lock().unwrap().push(req);
            self.script.lock().unwrap().pop_front().expect("unexpected call")
        }
    }

    impl Provider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn generate(&self, req: ChatRequest) -> BoxFuture<'static, Result<Option<String>, ChatError>> {
            let out = match self.next(req) {
                Scripted::Buffered(r) => r,
                Scripted::Refuse(e) => Err(e),
                _ => panic!("expected a buffered call"),
            };
            Box::pin(async move { out })
        }

        fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, Result<ChunkStream, ChatError>> {
            let out = match self.next(req) {
                Scripted::Refuse(e) => Err(e),
                Scripted::Stream(items) => {
                    let items = items
                        .into_iter()
                        .map(|r| r.map(|t| ChatChunk { text: t.to_string() }));
                    Ok(Box::pin(tokio_stream::iter(items)) as ChunkStream)
                }
                Scripted::Stall(items) => {
                    let items = items.into_iter().map(|t| Ok(ChatChunk { text: t.to_string() }));
                    let s = tokio_stream::iter(items).chain(tokio_stream::pending());
                    Ok(Box::pin(s) as ChunkStream)
                }
                Scripted::Buffered(_) => panic!("expected a streaming call"),
            };
            Box::pin(async move { out })
        }

        fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, ChatError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    #[derive(Default)]
    struct CountingContext {
        calls: AtomicUsize,
    }

    impl ContextProvider for CountingContext {
        fn system_instruction(&self) -> String {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            format!("context #{n}")
        }
    }

    fn conversation(fake: &Arc<FakeProvider>) -> Conversation {
        Conversation::new(fake.clone(), Arc::new(CountingContext::default()))
    }

    fn said_hi() -> Vec<Turn> {
        vec![Turn::user("Hi"), Turn::model("Hello")]
    }

    async fn stream(
        conv: &mut Conversation,
        prompt: &str,
    ) -> (Result<Reply, ChatError>, Vec<String>) {
        let mut deltas = Vec::new();
        let cancel = CancellationToken::new();
        let out = conv
            .send_streaming("m1", prompt, &cancel, |d| deltas.push(d.to_string()))
            .await;
        (out, deltas)
    }

    #[tokio::test]
    async fn streaming_success_commits_user_and_model_turns() {
        let fake = FakeProvider::with(vec![Scripted::Stream(vec![Ok("Hel"), Ok("lo")])]);
        let mut conv = conversation(&fake);

        let (out, deltas) = stream(&mut conv, "Hi").await;

        assert_eq!(out.unwrap(), Reply::Text("Hello".to_string()));
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(conv.history(), said_hi().as_slice());
        assert_eq!(conv.depth(), 1);
    }

    #[tokio::test]
    async fn request_carries_whole_history_and_fresh_context() {
        let fake = FakeProvider::with(vec![
            Scripted::Stream(vec![Ok("Hello")]),
            Scripted::Buffered(Ok(Some("Fine".to_string()))),
        ]);
        let mut conv = conversation(&fake);
        stream(&mut conv, "Hi").await.0.unwrap();
        conv.send("m1", "How are you?", &CancellationToken::new())
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(calls[0].model, "m1");
        assert_eq!(calls[0].contents, vec![Turn::user("Hi")]);
        assert_eq!(calls[0].system_instruction, "context #1");
        assert_eq!(
            calls[1].contents,
            vec![Turn::user("Hi"), Turn::model("Hello"), Turn::user("How are you?")]
        );
        assert_eq!(calls[1].system_instruction, "context #2");
        assert_eq!(conv.history().len(), 4);
        assert_eq!(conv.history()[3], Turn::model("Fine"));
    }

    #[tokio::test]
    async fn refused_stream_rolls_back() {
        let fake = FakeProvider::with(vec![Scripted::Refuse(
            ChatError::transport("Gemini API error: HTTP 500").with_status(500),
        )]);
        let mut conv = conversation(&fake);

        let (out, deltas) = stream(&mut conv, "Hi").await;

        let err = out.unwrap_err();
        assert_eq!(err.kind, ChatErrorKind::Transport);
        assert_eq!(err.status, Some(500));
        assert!(deltas.is_empty());
        assert!(conv.history().is_empty());
    }

    #[tokio::test]
    async fn failure_after_headers_rolls_back_after_partial_deltas() {
        let fake = FakeProvider::with(vec![Scripted::Stream(vec![
            Ok("Hel"),
            Err(ChatError::transport("network stream error: connection reset")),
            Ok("never"),
        ])]);
        let mut conv = conversation(&fake);

        let (out, deltas) = stream(&mut conv, "Hi").await;

        assert_eq!(out.unwrap_err().kind, ChatErrorKind::Transport);
        assert_eq!(deltas, vec!["Hel"]);
        assert!(conv.history().is_empty());
    }

    #[tokio::test]
    async fn rollback_keeps_an_identical_earlier_prompt() {
        let fake = FakeProvider::with(vec![
            Scripted::Stream(vec![Ok("Hello")]),
            Scripted::Refuse(ChatError::transport("connection refused")),
        ]);
        let mut conv = conversation(&fake);
        stream(&mut conv, "Hi").await.0.unwrap();

        let (out, _) = stream(&mut conv, "Hi").await;

        assert!(out.is_err());
        assert_eq!(conv.history(), said_hi().as_slice());
    }

    #[tokio::test]
    async fn same_prompt_can_be_retried_after_failure() {
        let fake = FakeProvider::with(vec![
            Scripted::Buffered(Err(ChatError::decode("failed to parse Gemini response"))),
            Scripted::Buffered(Ok(Some("Hello".to_string()))),
        ]);
        let mut conv = conversation(&fake);
        let cancel = CancellationToken::new();

        let err = conv.send("m1", "Hi", &cancel).await.unwrap_err();
        assert_eq!(err.kind, ChatErrorKind::Decode);
        assert!(conv.history().is_empty());

        let out = conv.send("m1", "Hi", &cancel).await.unwrap();
        assert_eq!(out.text(), Some("Hello"));
        assert_eq!(conv.history(), said_hi().as_slice());
        assert_eq!(fake.calls()[1].contents, vec![Turn::user("Hi")]);
    }

    #[tokio::test]
    async fn empty_results_add_no_turns() {
        let fake = FakeProvider::with(vec![
            Scripted::Buffered(Ok(None)),
            Scripted::Buffered(Ok(Some(String::new()))),
            Scripted::Stream(vec![]),
        ]);
        let mut conv = conversation(&fake);
        let cancel = CancellationToken::new();

        assert_eq!(conv.send("m1", "Hi", &cancel).await.unwrap(), Reply::Empty);
        assert_eq!(conv.send("m1", "Hi", &cancel).await.unwrap(), Reply::Empty);
        let (out, deltas) = stream(&mut conv, "Hi").await;
        assert_eq!(out.unwrap(), Reply::Empty);
        assert!(deltas.is_empty());
        assert!(conv.history().is_empty());
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_side_effects() {
        let fake = FakeProvider::with(vec![]);
        let mut conv = conversation(&fake);
        let cancel = CancellationToken::new();

        let cases = [
            ("m1", "   "),
            ("m1", ""),
            ("m1", "\n\t"),
            (" ", "Hi"),
            ("foo?x", "Hi"),
            ("a#b", "Hi"),
            ("models/a", "Hi"),
            ("gemini 2", "Hi"),
        ];
        for (model, prompt) in cases {
            let err = conv.send(model, prompt, &cancel).await.unwrap_err();
            assert_eq!(err.kind, ChatErrorKind::Validation);
            let err = conv
                .send_streaming(model, prompt, &cancel, |_| {})
                .await
                .unwrap_err();
            assert_eq!(err.kind, ChatErrorKind::Validation);
            let err = conv.send_single_turn(model, prompt, &cancel).await.unwrap_err();
            assert_eq!(err.kind, ChatErrorKind::Validation);
        }

        assert!(conv.history().is_empty());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_rolls_back() {
        let fake = FakeProvider::with(vec![
            Scripted::Stream(vec![Ok("Hello")]),
            Scripted::Stall(vec!["par", "tial"]),
        ]);
        let mut conv = conversation(&fake);
        stream(&mut conv, "Hi").await.0.unwrap();

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let mut deltas = Vec::new();
        let out = conv
            .send_streaming("m1", "Tell me more", &cancel, |d| {
                deltas.push(d.to_string());
                trip.cancel();
            })
            .await;

        assert!(out.unwrap_err().is_cancelled());
        assert_eq!(deltas, vec!["par"]);
        assert_eq!(conv.history(), said_hi().as_slice());
    }

    #[tokio::test]
    async fn cancelled_before_start_changes_nothing() {
        let fake = FakeProvider::with(vec![Scripted::Buffered(Ok(Some("late".to_string())))]);
        let mut conv = conversation(&fake);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = conv.send("m1", "Hi", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(conv.history().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_call_rolls_back() {
        let fake = FakeProvider::with(vec![Scripted::Stall(vec!["never finishes"])]);
        let mut conv = conversation(&fake);
        let cancel = CancellationToken::new();

        let call = conv.send_streaming("m1", "Hi", &cancel, |_| {});
        let timed_out = tokio::time::timeout(Duration::from_millis(20), call).await;

        assert!(timed_out.is_err());
        assert!(conv.history().is_empty());
    }

    #[tokio::test]
    async fn single_turn_calls_leave_history_alone() {
        let fake = FakeProvider::with(vec![
            Scripted::Stream(vec![Ok("Hello")]),
            Scripted::Buffered(Ok(Some("Paris".to_string()))),
            Scripted::Stream(vec![Ok("Ber"), Ok("lin")]),
        ]);
        let mut conv = conversation(&fake);
        stream(&mut conv, "Hi").await.0.unwrap();
        let cancel = CancellationToken::new();

        let out = conv
            .send_single_turn("m1", "Capital of France?", &cancel)
            .await
            .unwrap();
        assert_eq!(out.text(), Some("Paris"));

        let mut deltas = String::new();
        let out = conv
            .stream_single_turn("m1", "Capital of Germany?", &cancel, |d| deltas.push_str(d))
            .await
            .unwrap();
        assert_eq!(out.text(), Some("Berlin"));
        assert_eq!(deltas, "Berlin");

        let calls = fake.calls();
        assert_eq!(calls[1].contents, vec![Turn::user("Capital of France?")]);
        assert_eq!(calls[2].contents, vec![Turn::user("Capital of Germany?")]);
        assert_eq!(conv.history(), said_hi().as_slice());
    }

    #[tokio::test]
    async fn deltas_concatenate_to_committed_turn() {
        let parts = vec![Ok("The "), Ok("answer "), Ok("is "), Ok("42.")];
        let fake = FakeProvider::with(vec![Scripted::Stream(parts)]);
        let mut conv = conversation(&fake);

        let (out, deltas) = stream(&mut conv, "Question?").await;

        let committed = &conv.history()[1];
        assert_eq!(committed.role, Role::Model);
        assert_eq!(deltas.concat(), committed.text);
        assert_eq!(out.unwrap().text(), Some(committed.text.as_str()));
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let fake = FakeProvider::with(vec![Scripted::Stream(vec![Ok("Hello")])]);
        let mut conv = conversation(&fake);
        stream(&mut conv, "Hi").await.0.unwrap();

        conv.reset();

        assert!(conv.history().is_empty());
        assert_eq!(conv.depth(), 0);
    }
}
