use serde::Serialize;

/// Size comparison between the full-precision and quantized artifacts.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuantizationSummary {
    pub baseline_size_bytes: u64,
    pub quantized_size_bytes: Option<u64>,
    pub size_reduction_percent: Option<f64>,
    pub serving_quantized: bool,
}

impl QuantizationSummary {
    pub fn from_sizes(
        baseline_size_bytes: u64,
        quantized_size_bytes: Option<u64>,
        serving_quantized: bool,
    ) -> QuantizationSummary {
        let reduction = quantized_size_bytes.map(|quantized| {
            if baseline_size_bytes == 0 {
                0.0
            } else {
                let diff = baseline_size_bytes.saturating_sub(quantized) as f64;
                (diff / baseline_size_bytes as f64) * 100.0
            }
        });

        QuantizationSummary {
            baseline_size_bytes,
            quantized_size_bytes,
            size_reduction_percent: reduction,
            serving_quantized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_reduction_against_baseline() {
        let summary = QuantizationSummary::from_sizes(400, Some(100), true);
        assert_eq!(summary.size_reduction_percent, Some(75.0));
        assert!(summary.serving_quantized);
    }

    #[test]
    fn no_quantized_artifact_means_no_reduction() {
        let summary = QuantizationSummary::from_sizes(400, None, false);
        assert_eq!(summary.size_reduction_percent, None);
    }

    #[test]
    fn larger_quantized_artifact_saturates_at_zero() {
        let summary = QuantizationSummary::from_sizes(100, Some(150), true);
        assert_eq!(summary.size_reduction_percent, Some(0.0));
    }
}
