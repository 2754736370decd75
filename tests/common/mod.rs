#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{Router, body::Body};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use henri_generation_service::{
    AppConfig, ModelRegistry, ServiceError, TextGenerator, build_router,
    model::{BackendKind, Completion, ConcurrencyLimits, GenerationParams, ModelMetadata},
};

pub enum Outcome {
    /// Returns the text as the model's continuation.
    Text(String),
    /// Echoes the prompt followed by the answer, like a full-text upstream.
    Echo(String),
    Loading,
    Failure(String),
}

pub struct ScriptedGenerator {
    outcome: Outcome,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<Completion, ServiceError> {
        self.prompts.lock().push(prompt.to_string());
        let text = match &self.outcome {
            Outcome::Text(text) => text.clone(),
            Outcome::Echo(answer) => format!("{prompt} {answer}"),
            Outcome::Loading => return Err(ServiceError::UpstreamUnavailable),
            Outcome::Failure(message) => return Err(ServiceError::Inference(message.clone())),
        };
        Ok(Completion {
            text,
            tokens_generated: Some(3),
            inference_time: Some(Duration::from_millis(5)),
        })
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            backend: BackendKind::Local,
            name: "scripted".into(),
            quantized: false,
            dtype: Some("float32".into()),
            size_bytes: None,
            adapter: None,
        }
    }
}

/// Holds every generation until `release` is notified.
#[derive(Default)]
pub struct GatedGenerator {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl TextGenerator for GatedGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _params: &GenerationParams,
    ) -> Result<Completion, ServiceError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(Completion {
            text: " done".into(),
            tokens_generated: Some(1),
            inference_time: Some(Duration::from_millis(1)),
        })
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            backend: BackendKind::Local,
            name: "gated".into(),
            quantized: false,
            dtype: None,
            size_bytes: None,
            adapter: None,
        }
    }
}

pub fn test_config(pairs: &[(&str, &str)]) -> Arc<AppConfig> {
    let env: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(AppConfig::from_lookup(|key| env.get(key).cloned()).unwrap())
}

pub fn app_with(generator: Arc<dyn TextGenerator>, pairs: &[(&str, &str)]) -> Router {
    let config = test_config(pairs);
    let registry = ModelRegistry::new(config.limits);
    registry.install(generator).unwrap();
    build_router(config, Arc::new(registry))
}

pub fn uninitialized_app() -> Router {
    let config = test_config(&[]);
    build_router(config, Arc::new(ModelRegistry::new(ConcurrencyLimits::default())))
}

pub async fn body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
