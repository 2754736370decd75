pub mod adapter;
mod artifacts;
mod backend;
pub mod decode;
mod registry;
mod remote;
pub mod sampling;
mod tokenizer;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

pub use artifacts::{Precision, load_with_fallback};
pub use backend::TextGenerator;
#[cfg(feature = "tch-backend")]
pub use loader::LocalModel;
pub use registry::{ConcurrencyLimits, ModelRegistry, Phase};
pub use remote::RemoteEndpoint;
pub use tokenizer::{load_tokenizer, truncate_from_left};
pub use types::{
    BackendKind, Completion, GenerationParams, GenerationRequest, GenerationResult,
    MODEL_LOADING_MESSAGE, ModelMetadata, Timing,
};
