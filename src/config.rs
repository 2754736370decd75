use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, bail, ensure};
use axum::http::HeaderValue;
use tokio::sync::Semaphore;

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{
    model::{BackendKind, ConcurrencyLimits, GenerationParams},
    prompt::PromptTemplate,
};

pub const DEFAULT_MAX_PROMPT_TOKENS: usize = 256;
const MAX_WAITING_GENERATIONS: usize = 4096;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub backend: BackendKind,
    pub template: PromptTemplate,
    pub generation: GenerationParams,
    pub model_id: String,
    pub baseline_module_path: PathBuf,
    pub quantized_module_path: Option<PathBuf>,
    pub tokenizer_path: PathBuf,
    pub adapter_path: Option<PathBuf>,
    pub max_prompt_tokens: usize,
    pub upstream: Option<UpstreamConfig>,
    pub cors: CorsPolicy,
    pub limits: ConcurrencyLimits,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

#[derive(Clone)]
pub struct UpstreamConfig {
    pub endpoint_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<HeaderValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorsPolicy {
    pub origins: AllowedOrigins,
    pub allow_credentials: bool,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            origins: AllowedOrigins::Any,
            allow_credentials: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let template = match lookup("PROMPT_TEMPLATE") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => PromptTemplate::default(),
        };

        let defaults = GenerationParams::default();
        let generation = GenerationParams {
            max_length: parsed(&lookup, "MAX_LENGTH").unwrap_or(defaults.max_length),
            temperature: parsed(&lookup, "TEMPERATURE").unwrap_or(defaults.temperature),
            top_p: parsed(&lookup, "TOP_P").unwrap_or(defaults.top_p),
            repetition_penalty: parsed(&lookup, "REPETITION_PENALTY"),
            do_sample: parsed(&lookup, "DO_SAMPLE").unwrap_or(defaults.do_sample),
        };
        ensure!(generation.max_length > 0, "MAX_LENGTH must be positive");
        ensure!(generation.temperature >= 0.0, "TEMPERATURE must not be negative");
        ensure!(
            generation.top_p > 0.0 && generation.top_p <= 1.0,
            "TOP_P must be in (0, 1]"
        );
        if let Some(penalty) = generation.repetition_penalty {
            ensure!(penalty > 0.0, "REPETITION_PENALTY must be positive");
        }

        let model_id =
            lookup("MODEL_ID").unwrap_or_else(|| "EleutherAI/gpt-neo-1.3B".to_string());
        let baseline_module_path = PathBuf::from(
            lookup("BASELINE_MODULE_PATH")
                .unwrap_or_else(|| "models/gpt_neo_baseline.ts".to_string()),
        );
        let quantized_module_path = lookup("QUANTIZED_MODULE_PATH").map(PathBuf::from);
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let adapter_path = lookup("ADAPTER_PATH").map(PathBuf::from);
        let max_prompt_tokens = parsed(&lookup, "MAX_PROMPT_TOKENS")
            .unwrap_or_else(|| DEFAULT_MAX_PROMPT_TOKENS.min(generation.max_length / 2));
        ensure!(
            max_prompt_tokens > 0 && max_prompt_tokens < generation.max_length,
            "MAX_PROMPT_TOKENS must be positive and below MAX_LENGTH ({})",
            generation.max_length
        );

        let upstream = lookup("ENDPOINT_URL").map(|endpoint_url| UpstreamConfig {
            endpoint_url,
            token: lookup("HF_TOKEN").filter(|t| !t.is_empty()),
            timeout: parsed(&lookup, "UPSTREAM_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(30)),
        });

        let backend = match lookup("BACKEND").as_deref().map(str::trim) {
            Some("local") => BackendKind::Local,
            Some("remote") => BackendKind::Remote,
            Some(other) => bail!("unknown BACKEND '{other}', expected 'local' or 'remote'"),
            None if upstream.is_some() => BackendKind::Remote,
            None => BackendKind::Local,
        };
        ensure!(
            backend != BackendKind::Remote || upstream.is_some(),
            "ENDPOINT_URL is required for the remote backend"
        );

        let cors = CorsPolicy::parse(
            lookup("CORS_ALLOWED_ORIGINS").as_deref().unwrap_or("*"),
            parsed(&lookup, "CORS_ALLOW_CREDENTIALS").unwrap_or(false),
        )?;

        let limits = ConcurrencyLimits {
            max_concurrent: parsed(&lookup, "MAX_CONCURRENT_GENERATIONS").unwrap_or(1),
            queue_depth: parsed(&lookup, "GENERATION_QUEUE_DEPTH").unwrap_or(8),
        };
        ensure!(
            limits.max_concurrent > 0,
            "MAX_CONCURRENT_GENERATIONS must be at least 1"
        );
        ensure!(
            limits.queue_depth <= MAX_WAITING_GENERATIONS,
            "GENERATION_QUEUE_DEPTH must not exceed {MAX_WAITING_GENERATIONS}"
        );
        ensure!(
            limits.max_concurrent <= Semaphore::MAX_PERMITS - MAX_WAITING_GENERATIONS,
            "MAX_CONCURRENT_GENERATIONS is too large"
        );

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            backend,
            template,
            generation,
            model_id,
            baseline_module_path,
            quantized_module_path,
            tokenizer_path,
            adapter_path,
            max_prompt_tokens,
            upstream,
            cors,
            limits,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

impl CorsPolicy {
    /// Wildcard origins cannot be combined with credentials.
    pub fn parse(origins: &str, allow_credentials: bool) -> anyhow::Result<Self> {
        let origins = origins.trim();
        if origins == "*" {
            ensure!(
                !allow_credentials,
                "CORS_ALLOW_CREDENTIALS cannot be enabled when all origins are allowed"
            );
            return Ok(Self {
                origins: AllowedOrigins::Any,
                allow_credentials,
            });
        }

        let list = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin '{o}'")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        ensure!(!list.is_empty(), "CORS_ALLOWED_ORIGINS is empty");
        ensure!(
            !list.iter().any(|o| o == "*"),
            "wildcard origin cannot be mixed with named origins"
        );

        Ok(Self {
            origins: AllowedOrigins::List(list),
            allow_credentials,
        })
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_to_local_backend_with_question_template() {
        let config = config(&[]).unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.template, PromptTemplate::QuestionAnswer);
        assert_eq!(config.generation, GenerationParams::default());
        assert_eq!(config.cors, CorsPolicy::default());
        assert_eq!(config.limits, ConcurrencyLimits::default());
        assert!(config.upstream.is_none());
    }

    #[test]
    fn endpoint_url_selects_remote_backend() {
        let config = config(&[
            ("ENDPOINT_URL", "https://example.endpoints.huggingface.cloud"),
            ("HF_TOKEN", "hf_secret"),
        ])
        .unwrap();
        assert_eq!(config.backend, BackendKind::Remote);
        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.timeout, Duration::from_secs(30));
        assert!(!format!("{upstream:?}").contains("hf_secret"));
    }

    #[test]
    fn remote_backend_requires_endpoint() {
        assert!(config(&[("BACKEND", "remote")]).is_err());
        assert!(config(&[("BACKEND", "cloud")]).is_err());
    }

    #[test]
    fn wildcard_origin_rejects_credentials() {
        assert!(
            config(&[
                ("CORS_ALLOWED_ORIGINS", "*"),
                ("CORS_ALLOW_CREDENTIALS", "true")
            ])
            .is_err()
        );
    }

    #[test]
    fn named_origins_may_use_credentials() {
        let config = config(&[
            (
                "CORS_ALLOWED_ORIGINS",
                "https://www.henriai.ca, https://henriai.ca",
            ),
            ("CORS_ALLOW_CREDENTIALS", "true"),
        ])
        .unwrap();
        assert!(config.cors.allow_credentials);
        assert_eq!(
            config.cors.origins,
            AllowedOrigins::List(vec![
                HeaderValue::from_static("https://www.henriai.ca"),
                HeaderValue::from_static("https://henriai.ca"),
            ])
        );
    }

    #[test]
    fn generation_knobs_are_validated() {
        assert!(config(&[("TOP_P", "1.5")]).is_err());
        assert!(config(&[("REPETITION_PENALTY", "0")]).is_err());
        let config = config(&[
            ("TEMPERATURE", "0.1"),
            ("TOP_P", "0.5"),
            ("REPETITION_PENALTY", "1.5"),
            ("DO_SAMPLE", "false"),
            ("MAX_LENGTH", "not-a-number"),
        ])
        .unwrap();
        assert_eq!(config.generation.temperature, 0.1);
        assert_eq!(config.generation.top_p, 0.5);
        assert_eq!(config.generation.repetition_penalty, Some(1.5));
        assert!(!config.generation.do_sample);
        assert_eq!(config.generation.max_length, 512);
    }

    #[test]
    fn prompt_tokens_leave_room_for_generation() {
        let defaults = config(&[]).unwrap();
        assert_eq!(defaults.max_prompt_tokens, DEFAULT_MAX_PROMPT_TOKENS);
        assert!(defaults.max_prompt_tokens < defaults.generation.max_length);

        assert!(config(&[("MAX_PROMPT_TOKENS", "512")]).is_err());
        assert!(config(&[("MAX_PROMPT_TOKENS", "0")]).is_err());
        assert!(config(&[("MAX_LENGTH", "64"), ("MAX_PROMPT_TOKENS", "100")]).is_err());

        let short = config(&[("MAX_LENGTH", "64")]).unwrap();
        assert_eq!(short.max_prompt_tokens, 32);
        let custom = config(&[("MAX_PROMPT_TOKENS", "400")]).unwrap();
        assert_eq!(custom.max_prompt_tokens, 400);
    }

    #[test]
    fn concurrency_limits_are_bounded() {
        let huge = usize::MAX.to_string();
        assert!(config(&[("GENERATION_QUEUE_DEPTH", huge.as_str())]).is_err());
        assert!(config(&[("MAX_CONCURRENT_GENERATIONS", huge.as_str())]).is_err());
        assert!(config(&[("MAX_CONCURRENT_GENERATIONS", "0")]).is_err());

        let config = config(&[
            ("MAX_CONCURRENT_GENERATIONS", "2"),
            ("GENERATION_QUEUE_DEPTH", "0"),
        ])
        .unwrap();
        assert_eq!(
            config.limits,
            ConcurrencyLimits {
                max_concurrent: 2,
                queue_depth: 0
            }
        );
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(config(&[("PROMPT_TEMPLATE", "alpaca")]).is_err());
        let config = config(&[("PROMPT_TEMPLATE", "human")]).unwrap();
        assert_eq!(config.template, PromptTemplate::HumanAssistant);
    }
}
