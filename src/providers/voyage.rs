use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{http_client, EmbedOptions, Embedding, EmbeddingProvider, ProviderError};

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    input_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimension: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Voyage AI embeddings. `input_type` biases the embedding toward query or
/// document use when the config sets it.
pub struct VoyageClient {
    api_key: String,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://api.voyageai.com/v1";

impl VoyageClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageClient {
    async fn embed(
        &self,
        model: &str,
        inputs: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Embedding>, ProviderError> {
        let body = EmbedRequest {
            model,
            input: inputs,
            input_type: options.input_type.as_deref(),
            output_dimension: options.dimensions,
        };

        let client = http_client(options.timeout)?;
        let resp = client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Response(e.to_string()))?;

        if parsed.data.len() != inputs.len() {
            return Err(ProviderError::Response(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }

        let mut embeddings: Vec<Embedding> = parsed
            .data
            .into_iter()
            .map(|d| Embedding {
                index: d.index,
                vector: d.embedding,
            })
            .collect();
        embeddings.sort_by_key(|e| e.index);
        Ok(embeddings)
    }
}
