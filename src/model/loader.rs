use std::{fs, path::Path, sync::Arc, time::Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tokio::task;
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        BackendKind, Completion, GenerationParams, ModelMetadata, TextGenerator, adapter,
        artifacts::{Precision, load_with_fallback},
        decode::decode_loop,
        sampling::Sampler,
        tokenizer::load_tokenizer,
    },
    quantization::QuantizationSummary,
};

const EOS_TOKEN: &str = "<|endoftext|>";
const GPT2_EOS_TOKEN_ID: i64 = 50256;

/// TorchScript causal LM with its tokenizer, loaded once at startup.
pub struct LocalModel {
    model_id: String,
    tokenizer: Arc<Tokenizer>,
    instance: Arc<ModelInstance>,
    eos_token_id: i64,
    adapter: Option<String>,
    quantization: Option<QuantizationSummary>,
}

pub struct ModelInstance {
    precision: Precision,
    dtype: String,
    size_bytes: u64,
    device: Device,
    module: Mutex<tch::CModule>,
}

impl LocalModel {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let tokenizer = load_tokenizer(&config.tokenizer_path, config.max_prompt_tokens)?;
        let eos_token_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .map(i64::from)
            .unwrap_or(GPT2_EOS_TOKEN_ID);

        let (instance, precision) = load_with_fallback(
            config.quantized_module_path.as_deref(),
            &config.baseline_module_path,
            |precision, path| ModelInstance::new(precision, path, config.device),
        )?;
        let quantized_size = (precision == Precision::Quantized).then_some(instance.size_bytes);

        let quantization = fs::metadata(&config.baseline_module_path)
            .ok()
            .map(|meta| {
                QuantizationSummary::from_sizes(
                    meta.len(),
                    quantized_size,
                    instance.precision == Precision::Quantized,
                )
            });

        let adapter = match config.adapter_path.as_ref() {
            Some(dir) => {
                info!(path = %dir.display(), "merging adapter weights");
                let merged = adapter::merge_into(&instance.module.lock(), dir)?;
                info!(merged, "adapter merged");
                Some(dir.display().to_string())
            }
            None => None,
        };

        info!(precision = ?instance.precision, dtype = %instance.dtype, "model loading complete");

        Ok(Self {
            model_id: config.model_id.clone(),
            tokenizer: Arc::new(tokenizer),
            instance: Arc::new(instance),
            eos_token_id,
            adapter,
            quantization,
        })
    }
}

#[async_trait]
impl TextGenerator for LocalModel {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Completion, ServiceError> {
        let instance = self.instance.clone();
        let tokenizer = self.tokenizer.clone();
        let prompt = prompt.to_string();
        let params = params.clone();
        let eos = self.eos_token_id;

        task::spawn_blocking(move || instance.generate(&tokenizer, &prompt, &params, eos))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            backend: BackendKind::Local,
            name: self.model_id.clone(),
            quantized: self.instance.precision == Precision::Quantized,
            dtype: Some(self.instance.dtype.clone()),
            size_bytes: Some(self.instance.size_bytes),
            adapter: self.adapter.clone(),
        }
    }

    fn quantization(&self) -> Option<QuantizationSummary> {
        self.quantization.clone()
    }
}

impl ModelInstance {
    pub fn new(precision: Precision, module_path: &Path, device: Device) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::Initialization(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        info!(path = %module_path.display(), ?precision, "loading model");
        let size_bytes = fs::metadata(module_path)?.len();
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Initialization(e.to_string()))?;
        module.set_eval();

        let dtype = module
            .named_parameters()
            .ok()
            .and_then(|params| params.first().map(|(_, t)| format!("{:?}", t.kind())))
            .unwrap_or_else(|| match precision {
                Precision::Quantized => "qint8".to_string(),
                Precision::Full => "float32".to_string(),
            });

        Ok(Self {
            precision,
            dtype,
            size_bytes,
            device,
            module: Mutex::new(module),
        })
    }

    fn generate(
        &self,
        tokenizer: &Tokenizer,
        prompt: &str,
        params: &GenerationParams,
        eos_token_id: i64,
    ) -> Result<Completion, ServiceError> {
        let encoding = tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            input_ids.push(eos_token_id);
        }

        let sampler = Sampler::new(params);
        let mut rng = rand::thread_rng();

        let start = Instant::now();

        let generated = no_grad(|| {
            let module = self.module.lock();

            decode_loop(&input_ids, params.max_length, eos_token_id, |sequence| {
                let input_tensor = Tensor::from_slice(sequence)
                    .reshape([1, sequence.len() as i64])
                    .to(self.device);

                // Traced causal LMs return either bare logits or (logits, past).
                let output = module
                    .forward_is(&[tch::IValue::Tensor(input_tensor)])
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                // [1, seq_len, vocab] -> [vocab]
                let last_logits = logits
                    .select(1, -1)
                    .squeeze_dim(0)
                    .to_kind(Kind::Float)
                    .to_device(Device::Cpu);
                let mut row = Vec::<f32>::try_from(&last_logits)
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;

                Ok(sampler
                    .next_token(&mut row, sequence, &mut rng)
                    .map(|next| next as i64))
            })
        })?;

        let inference_time = start.elapsed();

        let generated_ids: Vec<u32> = generated.iter().map(|&id| id as u32).collect();
        let text = tokenizer
            .decode(&generated_ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        Ok(Completion {
            text,
            tokens_generated: Some(generated.len()),
            inference_time: Some(inference_time),
        })
    }
}
