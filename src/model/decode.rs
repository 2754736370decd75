//! Autoregressive decode driver, independent of the tensor backend.

use crate::error::ServiceError;

/// New tokens allowed once the prompt occupies `prompt_len` of `max_length`.
pub fn decode_budget(max_length: usize, prompt_len: usize) -> usize {
    max_length.saturating_sub(prompt_len)
}

/// Extends `prompt_ids` one token at a time. `step` sees the whole sequence
/// so far and returns the next id, or `None` when it has nothing to add.
///
/// Stops after emitting `eos` or once the sequence reaches `max_length`.
/// Only the generated ids are returned, never the prompt.
pub fn decode_loop<F>(
    prompt_ids: &[i64],
    max_length: usize,
    eos_token_id: i64,
    mut step: F,
) -> Result<Vec<i64>, ServiceError>
where
    F: FnMut(&[i64]) -> Result<Option<i64>, ServiceError>,
{
    let mut sequence = prompt_ids.to_vec();

    for _ in 0..decode_budget(max_length, prompt_ids.len()) {
        let Some(next) = step(&sequence)? else {
            break;
        };
        sequence.push(next);

        if next == eos_token_id {
            break;
        }
    }

    Ok(sequence.split_off(prompt_ids.len()))
}
