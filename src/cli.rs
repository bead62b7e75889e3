use clap::{Parser, Subcommand};

/// Chat with Gemini models from the terminal
#[derive(Debug, Parser)]
#[command(name = "gemini-chat")]
#[command(version)]
#[command(about = "Chat with Gemini models from the terminal", long_about = None)]
pub struct Args {
    /// Model name
    #[arg(short = 'm', long = "model", global = true)]
    pub model: Option<String>,

    /// Provider (default: config/provider or "google")
    #[arg(long = "provider", global = true)]
    pub provider: Option<String>,

    /// API root (default: GEMINI_BASE_URL, config/base_url, or the public endpoint)
    #[arg(long = "base-url", global = true)]
    pub base_url: Option<String>,

    /// Wait for the whole answer instead of streaming it
    #[arg(long = "no-stream", global = true)]
    pub no_stream: bool,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start an interactive multi-turn chat
    Chat,

    /// List models offered by the provider
    Models,

    /// Run an interactive terminal chat UI
    #[cfg(feature = "tui")]
    Tui,
}
