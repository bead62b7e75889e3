#[cfg(feature = "google")]
pub mod google;
pub mod sse;
pub mod stub;
mod types;
pub(crate) mod wire;

pub use types::{ChatChunk, ChatRequest, ChunkStream, ModelInfo, Provider, Role, Turn};
