use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MODEL_LOADING_MESSAGE: &str = "Model is loading, please try again in a minute";

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    #[serde(alias = "message")]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub response: String,
    pub timing: Timing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timing {
    pub total_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time: Option<f64>,
}

impl GenerationResult {
    pub fn new(response: String, total: Duration, generation: Option<Duration>) -> Self {
        Self {
            response,
            timing: Timing {
                total_time: Some(round_secs(total)),
                generation_time: generation.map(round_secs),
            },
        }
    }

    pub fn model_loading() -> Self {
        Self {
            response: MODEL_LOADING_MESSAGE.to_string(),
            timing: Timing {
                total_time: None,
                generation_time: None,
            },
        }
    }
}

fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

/// Decoding knobs fixed per deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: Option<f64>,
    pub do_sample: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 512,
            temperature: 0.7,
            top_p: 0.95,
            repetition_penalty: None,
            do_sample: true,
        }
    }
}

/// Raw output of one backend call, before template extraction.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_generated: Option<usize>,
    pub inference_time: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub backend: BackendKind,
    pub name: String,
    pub quantized: bool,
    pub dtype: Option<String>,
    pub size_bytes: Option<u64>,
    pub adapter: Option<String>,
}
