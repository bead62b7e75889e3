//! JSON bodies of the Generative Language REST API.

use super::{ModelInfo, Turn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub system_instruction: Content,
}

impl GenerateContentRequest {
    pub fn new(history: &[Turn], system_instruction: &str) -> Self {
        Self {
            contents: history
                .iter()
                .map(|t| Content::text(t.role.as_str(), &t.text))
                .collect(),
            system_instruction: Content::text("system", system_instruction),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl GenerateContentResponse {
    /// Text of the first part of the first candidate, if it has any.
    pub fn first_text(&self) -> Option<&str> {
        let cand = self.candidates.first()?;
        let part = cand.content.as_ref()?.parts.first()?;
        part.text.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyRating {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub probability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
}

impl From<Model> for ModelInfo {
    fn from(m: Model) -> Self {
        let id = m
            .name
            .strip_prefix("models/")
            .map(str::to_string)
            .unwrap_or(m.name);
        ModelInfo {
            id,
            display_name: m.display_name,
            description: m.description,
            methods: m.supported_generation_methods,
        }
    }
}
