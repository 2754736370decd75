use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        BackendKind, Completion, GenerationParams, ModelMetadata, TextGenerator,
        remote::RemoteEndpoint,
    },
    quantization::QuantizationSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    /// Generations allowed to run at the same time.
    pub max_concurrent: usize,
    /// Requests allowed to wait for a free slot before being rejected.
    pub queue_depth: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            queue_depth: 8,
        }
    }
}

/// Owns the process-wide generator. It is set at most once; until then
/// every generation call fails with [`ServiceError::NotReady`].
pub struct ModelRegistry {
    generator: OnceCell<Arc<dyn TextGenerator>>,
    failure: OnceCell<String>,
    admission: Semaphore,
    slots: Semaphore,
}

impl ModelRegistry {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        let max_concurrent = limits.max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        let admitted = max_concurrent
            .saturating_add(limits.queue_depth)
            .min(Semaphore::MAX_PERMITS);
        Self {
            generator: OnceCell::new(),
            failure: OnceCell::new(),
            admission: Semaphore::new(admitted),
            slots: Semaphore::new(max_concurrent),
        }
    }

    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let registry = Self::new(config.limits);
        registry.load(config)?;
        Ok(registry)
    }

    pub fn load(&self, config: &AppConfig) -> Result<(), ServiceError> {
        match build_generator(config) {
            Ok(generator) => self.install(generator),
            Err(err) => {
                error!(error = %err, "model initialization failed");
                let _ = self.failure.set(err.to_string());
                Err(err)
            }
        }
    }

    pub fn install(&self, generator: Arc<dyn TextGenerator>) -> Result<(), ServiceError> {
        let metadata = generator.metadata();
        self.generator
            .set(generator)
            .map_err(|_| ServiceError::Initialization("model already initialized".into()))?;
        info!(backend = ?metadata.backend, model = %metadata.name, "model ready");
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        if self.generator.get().is_some() {
            Phase::Ready
        } else if self.failure.get().is_some() {
            Phase::Failed
        } else {
            Phase::Uninitialized
        }
    }

    fn generator(&self) -> Result<&Arc<dyn TextGenerator>, ServiceError> {
        self.generator.get().ok_or(ServiceError::NotReady)
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.generator.get().map(|g| g.metadata())
    }

    pub fn quantization(&self) -> Option<QuantizationSummary> {
        self.generator.get().and_then(|g| g.quantization())
    }

    /// Runs one generation under the single-flight discipline: waits for a
    /// free slot while the wait queue has room, otherwise rejects.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Completion, ServiceError> {
        let generator = self.generator()?;

        let _admitted = self.admission.try_acquire().map_err(|_| {
            warn!("generation queue full, rejecting request");
            ServiceError::Busy
        })?;
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| ServiceError::NotReady)?;

        generator.generate(prompt, params).await
    }
}

fn build_generator(config: &AppConfig) -> Result<Arc<dyn TextGenerator>, ServiceError> {
    match config.backend {
        BackendKind::Remote => {
            let upstream = config.upstream.as_ref().ok_or_else(|| {
                ServiceError::Initialization(
                    "ENDPOINT_URL is required for the remote backend".into(),
                )
            })?;
            info!(endpoint = %upstream.endpoint_url, "using remote inference endpoint");
            Ok(Arc::new(RemoteEndpoint::new(upstream, &config.model_id)?))
        }
        BackendKind::Local => load_local(config),
    }
}

#[cfg(feature = "tch-backend")]
fn load_local(config: &AppConfig) -> Result<Arc<dyn TextGenerator>, ServiceError> {
    Ok(Arc::new(crate::model::LocalModel::load(config)?))
}

#[cfg(not(feature = "tch-backend"))]
fn load_local(_config: &AppConfig) -> Result<Arc<dyn TextGenerator>, ServiceError> {
    Err(ServiceError::Initialization(
        "local backend requires the tch-backend feature".into(),
    ))
}
