//! Console chat against the configured backend, using the same template
//! and extraction rule as the HTTP service.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use henri_generation_service::{AppConfig, ModelRegistry, ServiceError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = AppConfig::from_env()?;
    let registry = ModelRegistry::initialize(&config)?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"You: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }

        let prompt = config.template.format(text);
        let reply = match registry.generate(&prompt, &config.generation).await {
            Ok(completion) => config.template.extract(&completion.text).to_string(),
            Err(ServiceError::UpstreamUnavailable) => {
                henri_generation_service::model::MODEL_LOADING_MESSAGE.to_string()
            }
            Err(err) => format!("[error] {err}"),
        };
        stdout.write_all(format!("AI: {reply}\n\n").as_bytes()).await?;
    }

    Ok(())
}
