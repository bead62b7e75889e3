mod app;
mod chat;
mod cli;
mod config;
mod context;
mod error;
mod paths;
mod provider;
mod repl;
mod transcript;

#[cfg(feature = "tui")]
mod tui;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they never mix with streamed answers on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    // Resolve and create dirs early.
    let config_dir = paths::config_dir()?;
    let cfg = config::Config::load_optional(config_dir.join("config.toml"))?;
    let settings = app::Settings::resolve(&args, cfg.as_ref())?;
    tracing::debug!(?config_dir, model = %settings.model, "resolved config");

    let http = app::build_http(&settings)?;
    let provider = app::build_provider(&http, &settings)?;
    tracing::debug!(provider = provider.name(), "provider ready");

    match args.cmd {
        Some(cli::Command::Models) => {
            return app::cmd_models(&provider).await;
        }
        Some(cli::Command::Chat) => {
            let transcript = open_transcript(&settings);
            let conv = app::new_conversation(provider);
            return repl::Repl::new(conv, &settings, transcript).run().await;
        }
        #[cfg(feature = "tui")]
        Some(cli::Command::Tui) => {
            let conv = app::new_conversation(provider);
            return tui::run_tui(conv, &settings).await;
        }
        None => {}
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: gemini-chat \"Hello\" or `gemini-chat chat`");
    }

    let conv = app::new_conversation(provider);
    app::cmd_prompt(&conv, &settings, &prompt)
        .await
        .context("prompt failed")
}

fn open_transcript(settings: &app::Settings) -> Option<transcript::Transcript> {
    if !settings.transcript {
        return None;
    }
    let opened = paths::transcripts_dir().and_then(transcript::Transcript::create);
    match opened {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "conversation transcript disabled");
            None
        }
    }
}
