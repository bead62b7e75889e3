use crate::chat::{Conversation, Reply, SharedProvider};
use crate::context::EnvironmentContext;
use crate::provider::ModelInfo;
use crate::{cli, config, provider};
use anyhow::Context;
use reqwest::Url;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Settings after merging flags, environment, config file and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: String,
    pub provider: String,
    pub base_url: Url,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub stream: bool,
    pub transcript: bool,
}

impl Settings {
    pub fn resolve(args: &cli::Args, cfg: Option<&config::Config>) -> anyhow::Result<Self> {
        let defaults = config::Config::default();
        let cfg = cfg.unwrap_or(&defaults);

        let model = args
            .model
            .clone()
            .or_else(|| cfg.model.clone())
            .unwrap_or_else(|| config::DEFAULT_MODEL.to_string());

        let provider = args
            .provider
            .clone()
            .or_else(|| cfg.provider.clone())
            .unwrap_or_else(|| "google".to_string());

        let base_url = args
            .base_url
            .clone()
            .or_else(|| non_empty_env("GEMINI_BASE_URL"))
            .or_else(|| cfg.base_url.clone())
            .unwrap_or_else(|| config::DEFAULT_BASE_URL.to_string());
        let base_url = config::parse_base_url(&base_url)?;

        let api_key = non_empty_env("GEMINI_API_KEY").or_else(|| cfg.api_key.clone());

        Ok(Self {
            model,
            provider,
            base_url,
            api_key,
            timeout: Duration::from_secs(cfg.timeout_secs()),
            stream: cfg.stream() && !args.no_stream,
            transcript: cfg.transcript(),
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn build_http(settings: &Settings) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(settings.timeout)
        .build()
        .context("failed to build HTTP client")
}

pub fn build_provider(http: &reqwest::Client, settings: &Settings) -> anyhow::Result<SharedProvider> {
    match settings.provider.as_str() {
        "google" => {
            #[cfg(feature = "google")]
            {
                let Some(key) = settings.api_key.clone() else {
                    anyhow::bail!("No API key found. Set GEMINI_API_KEY or api_key in config.toml.");
                };
                let p = provider::google::GoogleProvider::new(http.clone(), key, settings.base_url.clone())
                    .with_timeout(settings.timeout);
                Ok(Arc::new(p))
            }
            #[cfg(not(feature = "google"))]
            {
                let _ = http;
                anyhow::bail!("google provider is not enabled in this build")
            }
        }
        "stub" => Ok(Arc::new(provider::stub::StubProvider::new())),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

pub fn new_conversation(provider: SharedProvider) -> Conversation {
    Conversation::new(provider, Arc::new(EnvironmentContext))
}

/// Answer a single prompt on stdout without keeping any history.
pub async fn cmd_prompt(conv: &Conversation, settings: &Settings, prompt: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(&cancel);

    let mut out = std::io::stdout();
    let result = if settings.stream {
        conv.stream_single_turn(&settings.model, prompt, &cancel, |delta| {
            print!("{delta}");
            out.flush().ok();
        })
        .await
    } else {
        conv.send_single_turn(&settings.model, prompt, &cancel).await.map(|reply| {
            if let Some(t) = reply.text() {
                print!("{t}");
            }
            reply
        })
    };
    watcher.abort();

    match result.context("request failed")? {
        Reply::Text(_) => println!(),
        Reply::Empty => eprintln!("(no response received)"),
    }
    Ok(())
}

/// Keep the models that can answer a prompt; flash first, then pro, then
/// by id descending so newer versions come first.
pub fn chat_models(models: Vec<ModelInfo>) -> Vec<ModelInfo> {
    let mut out: Vec<ModelInfo> = models
        .into_iter()
        .filter(|m| !m.id.is_empty() && m.methods.iter().any(|x| x == "generateContent"))
        .collect();
    out.sort_by(|a, b| {
        let rank = |m: &ModelInfo| (!m.id.contains("flash"), !m.id.contains("pro"));
        rank(a).cmp(&rank(b)).then_with(|| b.id.cmp(&a.id))
    });
    out
}

/// Offered when discovery fails or finds nothing usable.
pub fn fallback_models() -> Vec<ModelInfo> {
    [
        ("gemini-2.5-flash", "Gemini 2.5 Flash", "Fast and efficient"),
        ("gemini-2.0-flash", "Gemini 2.0 Flash", "Balanced performance"),
        ("gemini-1.5-pro", "Gemini 1.5 Pro", "High capability"),
    ]
    .into_iter()
    .map(|(id, name, about)| ModelInfo {
        id: id.to_string(),
        display_name: Some(name.to_string()),
        description: Some(format!("{about} (fallback)")),
        methods: vec!["generateContent".to_string()],
    })
    .collect()
}

pub async fn cmd_models(provider: &SharedProvider) -> anyhow::Result<()> {
    let models = provider.list_models().await.context("failed to list models")?;
    let models = chat_models(models);
    if models.is_empty() {
        println!("(no chat-capable models available)");
        return Ok(());
    }
    for m in &models {
        let about = m
            .description
            .as_deref()
            .or(m.display_name.as_deref())
            .unwrap_or("");
        println!("{}\t[{}]\t{}", m.id, m.methods.join(", "), truncate(about, 60));
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl-C. Abort the returned handle once the
/// guarded call is over.
pub fn cancel_on_ctrl_c(token: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
