pub mod config;
pub mod error;
pub mod model;
pub mod prompt;
pub mod quantization;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{GenerationRequest, GenerationResult, ModelRegistry, TextGenerator};
pub use prompt::PromptTemplate;
pub use server::{AppState, build_router};
