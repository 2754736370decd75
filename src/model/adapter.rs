//! LoRA adapter weights merged into the base model at load time.
//!
//! The adapter directory follows the PEFT layout: `adapter_config.json`
//! next to `adapter_model.safetensors`.

use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;
use tracing::debug;

use crate::error::ServiceError;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl AdapterConfig {
    pub fn parse(raw: &str) -> Result<Self, ServiceError> {
        let config: AdapterConfig = serde_json::from_str(raw)
            .map_err(|e| ServiceError::Initialization(format!("invalid adapter config: {e}")))?;
        if config.r == 0 {
            return Err(ServiceError::Initialization(
                "adapter rank `r` must be positive".into(),
            ));
        }
        Ok(config)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ServiceError> {
        let raw = std::fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))?;
        Self::parse(&raw)
    }

    pub fn scale(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraPart {
    A,
    B,
}

/// Low-rank factors for one base parameter: `delta = B · A`.
#[derive(Debug)]
pub struct LoraPair<T> {
    pub target: String,
    pub a: T,
    pub b: T,
}

/// Maps an adapter tensor name onto the base parameter it updates.
fn target_parameter(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    for (suffix, part) in [
        (".lora_A.weight", LoraPart::A),
        (".lora_A.default.weight", LoraPart::A),
        (".lora_B.weight", LoraPart::B),
        (".lora_B.default.weight", LoraPart::B),
    ] {
        if let Some(module) = key.strip_suffix(suffix) {
            return Some((format!("{module}.weight"), part));
        }
    }
    None
}

pub fn pair_lora_tensors<T>(named: Vec<(String, T)>) -> Result<Vec<LoraPair<T>>, ServiceError> {
    let mut halves: BTreeMap<String, (Option<T>, Option<T>)> = BTreeMap::new();

    for (key, tensor) in named {
        let Some((target, part)) = target_parameter(&key) else {
            debug!(%key, "skipping non-LoRA adapter tensor");
            continue;
        };
        let slot = halves.entry(target).or_insert((None, None));
        match part {
            LoraPart::A => slot.0 = Some(tensor),
            LoraPart::B => slot.1 = Some(tensor),
        }
    }

    halves
        .into_iter()
        .map(|(target, pair)| match pair {
            (Some(a), Some(b)) => Ok(LoraPair { target, a, b }),
            _ => Err(ServiceError::Initialization(format!(
                "adapter for {target} is missing one of lora_A/lora_B"
            ))),
        })
        .collect()
}

/// Folds the adapter into the module's parameters in place. Returns the
/// number of updated parameters.
#[cfg(feature = "tch-backend")]
pub fn merge_into(module: &tch::CModule, dir: &Path) -> Result<usize, ServiceError> {
    use std::collections::HashMap;

    use tch::Tensor;

    let config = AdapterConfig::from_dir(dir)?;
    let tensors = Tensor::read_safetensors(dir.join(ADAPTER_WEIGHTS_FILE))
        .map_err(|e| ServiceError::Initialization(format!("adapter weights: {e}")))?;
    let pairs = pair_lora_tensors(tensors)?;

    let params: HashMap<String, Tensor> = module
        .named_parameters()
        .map_err(|e| ServiceError::Initialization(e.to_string()))?
        .into_iter()
        .collect();
    let scale = config.scale();

    tch::no_grad(|| {
        for pair in &pairs {
            let mut target = params
                .get(&pair.target)
                .ok_or_else(|| {
                    ServiceError::Initialization(format!(
                        "adapter targets unknown parameter {}",
                        pair.target
                    ))
                })?
                .shallow_clone();
            let device = target.device();

            let mut delta = pair.b.to_device(device).matmul(&pair.a.to_device(device)) * scale;
            if config.fan_in_fan_out {
                delta = delta.tr();
            }
            let delta = delta.to_kind(target.kind());
            if delta.size() != target.size() {
                return Err(ServiceError::Initialization(format!(
                    "adapter shape {:?} does not match {} {:?}",
                    delta.size(),
                    pair.target,
                    target.size()
                )));
            }
            target
                .f_add_(&delta)
                .map_err(|e| ServiceError::Initialization(e.to_string()))?;
        }
        Ok(pairs.len())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_peft_keys_with_base_parameters() {
        let named = vec![
            (
                "base_model.model.transformer.h.0.attn.attention.q_proj.lora_A.weight".to_string(),
                1,
            ),
            (
                "base_model.model.transformer.h.0.attn.attention.q_proj.lora_B.weight".to_string(),
                2,
            ),
            ("lm_head.lora_A.default.weight".to_string(), 3),
            ("lm_head.lora_B.default.weight".to_string(), 4),
            ("base_model.model.score.modules_to_save.weight".to_string(), 5),
        ];

        let pairs = pair_lora_tensors(named).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].target, "lm_head.weight");
        assert_eq!((pairs[0].a, pairs[0].b), (3, 4));
        assert_eq!(pairs[1].target, "transformer.h.0.attn.attention.q_proj.weight");
        assert_eq!((pairs[1].a, pairs[1].b), (1, 2));
    }

    #[test]
    fn unpaired_factor_is_an_initialization_error() {
        let named = vec![("base_model.model.fc.lora_A.weight".to_string(), 1)];
        let err = pair_lora_tensors(named).unwrap_err();
        assert!(matches!(err, ServiceError::Initialization(msg) if msg.contains("fc.weight")));
    }

    #[test]
    fn config_scale_is_alpha_over_rank() {
        let config = AdapterConfig::parse(
            r#"{"r": 8, "lora_alpha": 32, "target_modules": ["q_proj", "v_proj"]}"#,
        )
        .unwrap();
        assert_eq!(config.scale(), 4.0);
        assert!(!config.fan_in_fan_out);
    }

    #[test]
    fn zero_rank_is_rejected() {
        assert!(AdapterConfig::parse(r#"{"r": 0, "lora_alpha": 16}"#).is_err());
    }
}
