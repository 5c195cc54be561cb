use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::types::ChatMessage;
use crate::config::LlmSettings;
use crate::errors::ChatError;

/// Chat-completion and embedding calls against one model server. The trait
/// is the injection seam for tests and alternative backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion of the whole answer.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError>;

    /// Streaming completion. The receiver yields answer fragments in order
    /// and closes after the final one. Dropping the receiver stops the
    /// producer on its next send.
    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError>;

    /// Embedding vectors for a batch of texts, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ChatError>;
}

/// Client for an OpenAI-compatible server (llama.cpp server, LM Studio,
/// vLLM). Streaming uses the SSE `data:` line protocol.
#[derive(Clone)]
pub struct OpenAiChatClient {
    base_url: String,
    model: String,
    embedding_model: String,
    temperature: f32,
    max_tokens: u32,
    client: Client,
}

impl OpenAiChatClient {
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            embedding_model: settings.embedding_model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            client: Client::new(),
        }
    }

    fn chat_body(&self, messages: &[ChatMessage], stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": stream,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let url = format!("{}/chat/completions", self.base_url);

        let res = self
            .client
            .post(&url)
            .json(&self.chat_body(messages, false))
            .send()
            .await
            .map_err(ChatError::generation)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ChatError::Generation(format!("model server error: {text}")));
        }

        let payload: Value = res.json().await.map_err(ChatError::generation)?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| ChatError::Generation("model response had no content".to_string()))
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError> {
        let url = format!("{}/chat/completions", self.base_url);

        let res = self
            .client
            .post(&url)
            .json(&self.chat_body(messages, true))
            .send()
            .await
            .map_err(ChatError::generation)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ChatError::Generation(format!("model server error: {text}")));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            // SSE lines can straddle chunk boundaries, so keep the tail of
            // the previous chunk around until its newline arrives.
            let mut buffer = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(newline) = buffer.find('\n') {
                            let line = buffer[..newline].trim().to_string();
                            buffer.drain(..=newline);

                            if line.is_empty() {
                                continue;
                            }
                            if line == "data: [DONE]" {
                                return;
                            }
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            let Ok(event) = serde_json::from_str::<Value>(data) else {
                                continue;
                            };
                            if let Some(content) = event["choices"][0]["delta"]["content"].as_str()
                            {
                                if !content.is_empty()
                                    && tx.send(Ok(content.to_string())).await.is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ChatError::generation(err))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ChatError> {
        let url = format!("{}/embeddings", self.base_url);

        let body = json!({
            "model": self.embedding_model,
            "input": texts,
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ChatError::generation)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(ChatError::Generation(format!("embedding error: {text}")));
        }

        let payload: Value = res.json().await.map_err(ChatError::generation)?;

        let mut embeddings = Vec::new();
        if let Some(data) = payload["data"].as_array() {
            for item in data {
                if let Some(values) = item["embedding"].as_array() {
                    let vector: Vec<f32> = values
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect();
                    embeddings.push(vector);
                }
            }
        }

        if embeddings.len() != texts.len() {
            return Err(ChatError::Generation(format!(
                "embedding count mismatch: sent {} texts, got {} vectors",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }
}
