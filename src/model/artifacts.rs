use std::path::Path;

use tracing::warn;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Quantized,
    Full,
}

/// Loads the quantized artifact when one is configured, falling back to the
/// full-precision baseline on any failure. A baseline failure is returned.
pub fn load_with_fallback<T, F>(
    quantized: Option<&Path>,
    baseline: &Path,
    mut load: F,
) -> Result<(T, Precision), ServiceError>
where
    F: FnMut(Precision, &Path) -> Result<T, ServiceError>,
{
    if let Some(path) = quantized {
        match load(Precision::Quantized, path) {
            Ok(model) => return Ok((model, Precision::Quantized)),
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    "quantized load failed, falling back to full precision"
                );
            }
        }
    }

    load(Precision::Full, baseline).map(|model| (model, Precision::Full))
}
