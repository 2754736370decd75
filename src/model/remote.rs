use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::UpstreamConfig,
    error::ServiceError,
    model::{BackendKind, Completion, GenerationParams, ModelMetadata, TextGenerator},
};

/// Managed inference endpoint speaking the text-generation JSON protocol.
pub struct RemoteEndpoint {
    client: reqwest::Client,
    endpoint_url: String,
    token: Option<String>,
    timeout: Duration,
    model_id: String,
}

#[derive(Debug, Serialize)]
struct InferencePayload<'a> {
    inputs: &'a str,
    parameters: InferenceParameters,
}

#[derive(Debug, Serialize)]
struct InferenceParameters {
    max_length: usize,
    temperature: f64,
    top_p: f64,
    do_sample: bool,
    return_full_text: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    generated_text: String,
}

impl RemoteEndpoint {
    pub fn new(upstream: &UpstreamConfig, model_id: &str) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(upstream.timeout)
            .build()
            .map_err(|e| ServiceError::Initialization(format!("http client: {e}")))?;

        if upstream.token.is_none() {
            warn!("HF_TOKEN is not set, calling the endpoint without credentials");
        }

        Ok(Self {
            client,
            endpoint_url: upstream.endpoint_url.clone(),
            token: upstream.token.clone(),
            timeout: upstream.timeout,
            model_id: model_id.to_string(),
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::UpstreamFailure(format!(
                "upstream request timed out after {}s",
                self.timeout.as_secs_f64()
            ))
        } else {
            ServiceError::UpstreamFailure(err.to_string())
        }
    }
}

#[async_trait]
impl TextGenerator for RemoteEndpoint {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Completion, ServiceError> {
        let payload = InferencePayload {
            inputs: prompt,
            parameters: InferenceParameters {
                max_length: params.max_length,
                temperature: params.temperature,
                top_p: params.top_p,
                do_sample: params.do_sample,
                return_full_text: false,
                repetition_penalty: params.repetition_penalty,
            },
        };

        let start = Instant::now();

        let mut request = self.client.post(&self.endpoint_url).json(&payload);
        if let Some(token) = self.token.as_ref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        info!(%status, "upstream responded");

        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(ServiceError::UpstreamUnavailable);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read response body>".to_string());
            return Err(ServiceError::UpstreamFailure(format!(
                "upstream returned {status}: {body}"
            )));
        }

        let generations: Vec<GeneratedText> =
            response.json().await.map_err(|e| self.transport_error(e))?;
        let inference_time = start.elapsed();

        let first = generations.into_iter().next().ok_or_else(|| {
            ServiceError::UpstreamFailure("upstream returned no generations".into())
        })?;

        Ok(Completion {
            text: first.generated_text,
            tokens_generated: None,
            inference_time: Some(inference_time),
        })
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            backend: BackendKind::Remote,
            name: self.model_id.clone(),
            quantized: false,
            dtype: None,
            size_bytes: None,
            adapter: None,
        }
    }
}
