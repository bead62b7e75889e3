use crate::error::ChatError;
use futures_core::future::BoxFuture;
use futures_core::stream::BoxStream;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One message of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Everything a provider needs for one call. Built fresh per call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub contents: Vec<Turn>,
    pub system_instruction: String,
}

#[derive(Debug, Clone)]
pub struct ChatChunk {
    pub text: String,
}

/// A model the provider can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub methods: Vec<String>,
}

pub type ChunkStream = BoxStream<'static, Result<ChatChunk, ChatError>>;

/// Provider interface: one HTTP exchange per call, no state across calls.
pub trait Provider {
    fn name(&self) -> &'static str;

    /// Send a buffered request. `Ok(None)` means the answer carried no text.
    fn generate(&self, req: ChatRequest) -> BoxFuture<'static, Result<Option<String>, ChatError>>;

    /// Start streaming a response. Fails before any delta if the server
    /// refuses the request.
    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, Result<ChunkStream, ChatError>>;

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, ChatError>>;
}
