// ── Mnemo Engine: Providers ─────────────────────────────────────────────────
//
// The external LLM boundary. The core only knows three narrow contracts:
//
//   embedding     text → []f32
//   tags          (text, ontology sample) → []name
//   propositions  text → []factoid
//
// Concrete implementations live here, behind trait objects: HTTP clients
// speaking Ollama or OpenAI-compatible endpoints, plus closure adapters so
// hosts (and tests) can inject plain callables. The core never embeds a
// provider SDK.
//
// Every call site wraps these in a circuit breaker (engine/breaker.rs);
// the clients themselves only do transport, timeouts, and parsing.

use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::info;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Contracts
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Produce a dense vector for `text`. The dimension must be stable for
    /// the lifetime of the store.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

#[async_trait]
pub trait TagProvider: Send + Sync {
    /// Propose hierarchical tag names for `text`. `ontology_sample` is a
    /// random slice of existing tag names the provider should prefer reusing.
    async fn extract_tags(&self, text: &str, ontology_sample: &[String])
        -> EngineResult<Vec<String>>;
}

#[async_trait]
pub trait PropositionProvider: Send + Sync {
    /// Decompose `text` into atomic factoids.
    async fn extract_propositions(&self, text: &str) -> EngineResult<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Closure adapters (host injection and tests)
// ═══════════════════════════════════════════════════════════════════════════

/// Wrap a plain `text → vector` function as an embedding provider.
pub struct FnEmbedding(Arc<dyn Fn(&str) -> EngineResult<Vec<f32>> + Send + Sync>);

impl FnEmbedding {
    pub fn new(f: impl Fn(&str) -> EngineResult<Vec<f32>> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl EmbeddingProvider for FnEmbedding {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        (self.0)(text)
    }
}

/// Wrap a `(text, sample) → names` function as a tag provider.
pub struct FnTags(
    Arc<dyn Fn(&str, &[String]) -> EngineResult<Vec<String>> + Send + Sync>,
);

impl FnTags {
    pub fn new(
        f: impl Fn(&str, &[String]) -> EngineResult<Vec<String>> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl TagProvider for FnTags {
    async fn extract_tags(
        &self,
        text: &str,
        ontology_sample: &[String],
    ) -> EngineResult<Vec<String>> {
        (self.0)(text, ontology_sample)
    }
}

/// Wrap a `text → factoids` function as a proposition provider.
pub struct FnPropositions(Arc<dyn Fn(&str) -> EngineResult<Vec<String>> + Send + Sync>);

impl FnPropositions {
    pub fn new(f: impl Fn(&str) -> EngineResult<Vec<String>> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl PropositionProvider for FnPropositions {
    async fn extract_propositions(&self, text: &str) -> EngineResult<Vec<String>> {
        (self.0)(text)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP embedding client
// ═══════════════════════════════════════════════════════════════════════════

/// Embedding over HTTP: tries the Ollama `/api/embed` endpoint, falls back
/// to the legacy `/api/embeddings`, then to OpenAI-format `/v1/embeddings`.
pub struct HttpEmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into(), model: model.into() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Ollama current API: POST /api/embed { model, input } → { embeddings: [[f32…]] }
    /// Falls back to legacy: POST /api/embeddings { model, prompt } → { embedding: [f32…] }
    async fn embed_ollama(&self, text: &str) -> EngineResult<Vec<f32>> {
        let body = json!({ "model": self.model, "input": text });
        let resp = self
            .client
            .post(self.url("/api/embed"))
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await;

        if let Ok(resp) = resp {
            if resp.status().is_success() {
                if let Ok(v) = resp.json::<Value>().await {
                    if let Some(vec) = parse_vector(&v["embeddings"][0])
                        .or_else(|| parse_vector(&v["embedding"]))
                    {
                        return Ok(vec);
                    }
                }
            }
        }

        let body = json!({ "model": self.model, "prompt": text });
        let resp = self
            .client
            .post(self.url("/api/embeddings"))
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| {
                EngineError::Embedding(format!(
                    "embedding endpoint not reachable at {}: {e}",
                    self.base_url
                ))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!("ollama embed {status}: {text}")));
        }
        let v: Value = resp.json().await?;
        parse_vector(&v["embedding"])
            .ok_or_else(|| EngineError::Embedding("no embedding array in response".into()))
    }

    /// OpenAI-compatible format: POST /v1/embeddings { model, input }
    async fn embed_openai(&self, text: &str) -> EngineResult<Vec<f32>> {
        let body = json!({ "model": self.model, "input": text });
        let resp = self
            .client
            .post(self.url("/v1/embeddings"))
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!("openai embed {status}: {text}")));
        }
        let v: Value = resp.json().await?;
        parse_vector(&v["data"][0]["embedding"])
            .ok_or_else(|| EngineError::Embedding("no data[0].embedding in response".into()))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let ollama_err = match self.embed_ollama(text).await {
            Ok(vec) => return Ok(vec),
            Err(e) => e,
        };
        match self.embed_openai(text).await {
            Ok(vec) => Ok(vec),
            Err(openai_err) => Err(EngineError::Embedding(format!(
                "embedding failed. ollama: {ollama_err} | openai: {openai_err}"
            ))),
        }
    }
}

fn parse_vector(v: &Value) -> Option<Vec<f32>> {
    let arr = v.as_array()?;
    let vec: Vec<f32> = arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
    (!vec.is_empty()).then_some(vec)
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP chat-backed tag / proposition providers
// ═══════════════════════════════════════════════════════════════════════════

/// Minimal OpenAI-compatible chat call shared by the tag and proposition
/// providers.
struct HttpChatClient {
    client: Client,
    base_url: String,
    model: String,
}

impl HttpChatClient {
    fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { client: Client::new(), base_url: base_url.into(), model: model.into() }
    }

    async fn complete(&self, system: &str, user: &str) -> EngineResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.0,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Other(format!("chat completion {status}: {text}")));
        }
        let v: Value = resp.json().await?;
        v["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Other("no choices[0].message.content".into()))
    }
}

/// Parse a provider reply that should be a JSON array of strings, with a
/// line-based fallback for models that answer in prose bullets.
fn parse_string_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    // Strip a markdown fence if present.
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(inner) {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }

    inner
        .lines()
        .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tag extraction over an OpenAI-compatible chat endpoint.
pub struct HttpTagClient {
    chat: HttpChatClient,
}

impl HttpTagClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { chat: HttpChatClient::new(base_url, model) }
    }
}

#[async_trait]
impl TagProvider for HttpTagClient {
    async fn extract_tags(
        &self,
        text: &str,
        ontology_sample: &[String],
    ) -> EngineResult<Vec<String>> {
        let system = "You label text with hierarchical topic tags. Tags are lowercase \
                      [a-z0-9-] segments joined by ':' and at most 5 levels deep, e.g. \
                      \"devops:kubernetes:pods\". Prefer reusing existing tags. Reply with \
                      a JSON array of tag strings and nothing else.";
        let user = format!(
            "Existing tags:\n{}\n\nText:\n{}",
            ontology_sample.join(", "),
            text
        );
        let raw = self
            .chat
            .complete(system, &user)
            .await
            .map_err(|e| EngineError::Tag(e.to_string()))?;
        let tags = parse_string_list(&raw);
        info!("[providers] tag provider proposed {} tags", tags.len());
        Ok(tags)
    }
}

/// Proposition extraction over an OpenAI-compatible chat endpoint.
pub struct HttpPropositionClient {
    chat: HttpChatClient,
}

impl HttpPropositionClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { chat: HttpChatClient::new(base_url, model) }
    }
}

#[async_trait]
impl PropositionProvider for HttpPropositionClient {
    async fn extract_propositions(&self, text: &str) -> EngineResult<Vec<String>> {
        let system = "Decompose the text into atomic, self-contained factual statements. \
                      Each statement must stand alone without pronouns. Reply with a JSON \
                      array of strings and nothing else.";
        let raw = self
            .chat
            .complete(system, text)
            .await
            .map_err(|e| EngineError::Proposition(e.to_string()))?;
        Ok(parse_string_list(&raw))
    }
}
