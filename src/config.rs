use anyhow::Context;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Default model (optional)
    pub model: Option<String>,

    /// Provider identifier ("google" or "stub").
    pub provider: Option<String>,

    /// API root; must be an absolute URL.
    pub base_url: Option<String>,

    /// API key; `GEMINI_API_KEY` takes precedence.
    pub api_key: Option<String>,

    /// Whole-request timeout in seconds (1..=300).
    pub timeout_secs: Option<u64>,

    /// Stream responses by default.
    pub stream: Option<bool>,

    /// Write a conversation transcript per session.
    pub transcript: Option<bool>,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(Some(cfg))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(base) = &self.base_url {
            parse_base_url(base)?;
        }
        if let Some(t) = self.timeout_secs {
            if !(1..=300).contains(&t) {
                anyhow::bail!("timeout_secs must be between 1 and 300 (got {t})");
            }
        }
        if let Some(m) = &self.model {
            if m.trim().is_empty() {
                anyhow::bail!("model must not be empty");
            }
        }
        Ok(())
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    pub fn stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }

    pub fn transcript(&self) -> bool {
        self.transcript.unwrap_or(true)
    }
}

/// Parse an API root, making sure relative joins land under it.
pub fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("base_url must not be empty");
    }
    let mut url = Url::parse(raw).with_context(|| format!("base_url must be a valid URL: {raw}"))?;
    if url.cannot_be_a_base() {
        anyhow::bail!("base_url must be an absolute http(s) URL: {raw}");
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
