use super::sse::DeltaStream;
use super::wire::{GenerateContentRequest, GenerateContentResponse, ModelList};
use super::{ChatChunk, ChatRequest, ChunkStream, ModelInfo, Provider};
use crate::error::ChatError;
use futures_core::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Url;
use std::time::Duration;
use tokio_stream::StreamExt;

#[derive(Debug, Clone)]
pub struct GoogleProvider {
    http: reqwest::Client,
    api_key: String,
    api_base: Url,
    /// Whole-request limit for buffered calls; streams are never cut off.
    timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Generate,
    Stream,
}

impl GoogleProvider {
    pub fn new(http: reqwest::Client, api_key: String, api_base: Url) -> Self {
        Self {
            http,
            api_key,
            api_base,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build_url(&self, model: &str, method: Method) -> Result<Url, ChatError> {
        // Docs: https://ai.google.dev/api/rest/v1beta/models/streamGenerateContent
        let segment = match method {
            Method::Generate => format!("{model}:generateContent"),
            Method::Stream => format!("{model}:streamGenerateContent"),
        };
        let mut url = self
            .api_base
            .join("v1beta/models/")
            .map_err(|e| ChatError::validation(format!("invalid API base: {e}")))?;
        // push() percent-encodes, so the id stays a single path segment.
        url.path_segments_mut()
            .map_err(|_| ChatError::validation("API base cannot carry a path"))?
            .pop_if_empty()
            .push(&segment);

        url.query_pairs_mut().append_pair("key", &self.api_key);
        if let Method::Stream = method {
            url.query_pairs_mut().append_pair("alt", "sse");
        }
        Ok(url)
    }

    fn headers(method: Method) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Method::Stream = method {
            h.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            h.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
        h
    }

    /// Send the request and wait for response headers, failing on any
    /// non-success status.
    async fn open(&self, req: &ChatRequest, method: Method) -> Result<reqwest::Response, ChatError> {
        let url = self.build_url(&req.model, method)?;
        let body = GenerateContentRequest::new(&req.contents, &req.system_instruction);

        tracing::info!(
            model = %req.model,
            turns = req.contents.len(),
            streaming = matches!(method, Method::Stream),
            "sending request to Gemini API"
        );

        let mut builder = self.http.post(url).headers(Self::headers(method)).json(&body);
        if let (Method::Generate, Some(t)) = (method, self.timeout) {
            builder = builder.timeout(t);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ChatError::transport(format!("failed to start Gemini request: {e}")))?;

        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    tracing::error!(%status, body = %text, "Gemini API request failed");
    Err(ChatError::transport(format!("Gemini API error: HTTP {status}: {text}"))
        .with_status(status.as_u16()))
}

impl Provider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn generate(&self, req: ChatRequest) -> BoxFuture<'static, Result<Option<String>, ChatError>> {
        let this = self.clone();

        Box::pin(async move {
            let resp = this.open(&req, Method::Generate).await?;
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ChatError::transport(format!("failed to read Gemini response: {e}")))?;
            let parsed: GenerateContentResponse = serde_json::from_slice(&bytes)
                .map_err(|e| ChatError::decode(format!("failed to parse Gemini response: {e}")))?;

            let text = parsed.first_text().map(str::to_string);
            tracing::info!(chars = text.as_ref().map_or(0, String::len), "received Gemini response");
            Ok(text)
        })
    }

    fn stream_chat(&self, req: ChatRequest) -> BoxFuture<'static, Result<ChunkStream, ChatError>> {
        let this = self.clone();

        Box::pin(async move {
            let resp = this.open(&req, Method::Stream).await?;
            let body = Box::pin(resp.bytes_stream());
            let out = DeltaStream::new(body).map(|item| item.map(|text| ChatChunk { text }));
            Ok(Box::pin(out) as ChunkStream)
        })
    }

    fn list_models(&self) -> BoxFuture<'static, Result<Vec<ModelInfo>, ChatError>> {
        let this = self.clone();

        Box::pin(async move {
            let mut url = this
                .api_base
                .join("v1beta/models")
                .map_err(|e| ChatError::validation(format!("invalid API base: {e}")))?;
            url.query_pairs_mut().append_pair("key", &this.api_key);

            let mut builder = this.http.get(url);
            if let Some(t) = this.timeout {
                builder = builder.timeout(t);
            }
            let resp = builder
                .send()
                .await
                .map_err(|e| ChatError::transport(format!("failed to list models: {e}")))?;
            let resp = check_status(resp).await?;
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ChatError::transport(format!("failed to read model list: {e}")))?;
            let list: ModelList = serde_json::from_slice(&bytes)
                .map_err(|e| ChatError::decode(format!("failed to parse model list: {e}")))?;

            Ok(list.models.into_iter().map(ModelInfo::from).collect())
        })
    }
}
