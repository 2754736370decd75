use async_trait::async_trait;

use crate::{
    error::ServiceError,
    model::{Completion, GenerationParams, ModelMetadata},
    quantization::QuantizationSummary,
};

/// A causal language model that turns one formatted prompt into text.
///
/// Implementations are shared across requests; callers serialize access
/// through [`crate::model::ModelRegistry`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Completion, ServiceError>;

    fn metadata(&self) -> ModelMetadata;

    fn quantization(&self) -> Option<QuantizationSummary> {
        None
    }
}
