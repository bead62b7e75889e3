use super::{ChatChunk, ChatRequest, ChunkStream, ModelInfo, Provider, Role};
use crate::error::ChatError;
use futures_core::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Offline provider that echoes the last user turn.
#[derive(Debug, Default, Clone)]
pub struct StubProvider;

impl StubProvider {
    pub fn new() -> Self {
        Self
    }

    fn reply_parts(req: &ChatRequest) -> Vec<String> {
        let prompt = req
            .contents
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.clone())
            .unwrap_or_default();
        let earlier = req.contents.len().saturating_sub(1) / 2;

        vec![
            format!("[stub provider, model: {}]\n", req.model),
            "You said: ".to_string(),
            prompt,
            format!("\n({earlier} earlier exchanges in context)"),
        ]
    }
}

impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn generate(&self, req: ChatRequest) -> BoxFuture<'static, Result<Option<String>, ChatError>> {
        Box::pin(async move { Ok(Some(Self::reply_parts(&req).concat())) })
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, Result<ChunkStream, ChatError>> {
        Box::pin(async move {
            // Drip the answer in small chunks with delays, like a real stream.
            let (tx, rx) = mpsc::channel::<Result<ChatChunk, ChatError>>(32);

            tokio::spawn(async move {
                for text in Self::reply_parts(&req) {
                    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
                    if tx.send(Ok(ChatChunk { text })).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as ChunkStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, ChatError>> {
        Box::pin(async move {
            Ok(vec![ModelInfo {
                id: "stub-echo".to_string(),
                display_name: Some("Stub Echo (offline)".to_string()),
                description: Some("Echoes the prompt without calling any API.".to_string()),
                methods: vec!["generateContent".to_string(), "streamGenerateContent".to_string()],
            }])
        })
    }
}
