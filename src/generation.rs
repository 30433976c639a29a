//! Vision-LLM client: photos in, resale listing out.
//!
//! Thin wrapper over an OpenAI-compatible chat-completions endpoint. Photos
//! arrive base64-encoded from the extension and are forwarded as data-URI
//! image parts; the model is instructed to answer with a JSON object holding
//! `title` and `description`. This is the paid call the usage governor gates.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Default chat-completions endpoint.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default vision-capable model.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Cap on photos forwarded per request; extras are ignored.
const MAX_PHOTOS: usize = 4;

const SYSTEM_PROMPT: &str = "You write resale listings. Given photos of one item, reply with a \
JSON object: {\"title\": \"...\", \"description\": \"...\"}. The title is under 80 characters \
and keyword-rich; the description is 2-4 short paragraphs covering condition, brand, size and \
flaws visible in the photos. Reply with JSON only.";

/// A generated resale listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub description: String,
}

/// Generation provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Client for the hosted generation API.
pub struct GenerationClient {
    config: GenerationConfig,
    http: reqwest::Client,
}

impl GenerationClient {
    pub fn new(config: GenerationConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self { config, http })
    }

    /// Generate a listing from base64-encoded photos plus optional seller
    /// notes. Errors here belong to the enclosing handler; the governor has
    /// already admitted the call by the time this runs.
    pub async fn generate(
        &self,
        photos_base64: &[String],
        notes: Option<&str>,
    ) -> anyhow::Result<Listing> {
        if photos_base64.is_empty() {
            anyhow::bail!("at least one photo is required");
        }

        let mut parts = vec![json!({
            "type": "text",
            "text": notes.unwrap_or("Generate the listing for the item in these photos."),
        })];
        for photo in photos_base64.iter().take(MAX_PHOTOS) {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{photo}") },
            }));
        }

        let payload = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": parts },
            ],
            "max_tokens": 700,
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("generation provider error ({status}): {body}");
        }

        let chat: ChatResponse = resp.json().await?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow::anyhow!("generation provider returned no choices"))?;

        Ok(parse_listing(content))
    }
}

/// Parse the model's reply. Strict JSON first; when the model wraps the
/// object in prose or code fences, fall back to the first line as title and
/// the rest as description.
fn parse_listing(content: &str) -> Listing {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(listing) = serde_json::from_str::<Listing>(trimmed) {
        return listing;
    }

    let mut lines = trimmed.lines();
    let title = lines.next().unwrap_or("Untitled listing").trim().to_string();
    let description = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    Listing { title, description }
}
