use std::path::Path;

use tokenizers::{Tokenizer, TruncationDirection, TruncationParams};
use tracing::info;

use crate::error::ServiceError;

pub fn load_tokenizer(path: &Path, max_prompt_tokens: usize) -> Result<Tokenizer, ServiceError> {
    info!(path = %path.display(), "loading tokenizer");
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| ServiceError::Initialization(format!("tokenizer: {e}")))?;
    truncate_from_left(&mut tokenizer, max_prompt_tokens)?;
    Ok(tokenizer)
}

/// Long prompts lose their head, so the template's trailing delimiter
/// is always the last thing the model sees.
pub fn truncate_from_left(
    tokenizer: &mut Tokenizer,
    max_prompt_tokens: usize,
) -> Result<(), ServiceError> {
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_prompt_tokens,
            direction: TruncationDirection::Left,
            ..Default::default()
        }))
        .map_err(|e| ServiceError::Initialization(format!("tokenizer: {e}")))?;
    Ok(())
}
