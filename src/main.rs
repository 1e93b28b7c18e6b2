use clap::Parser;
use llm_relay::billing::LogSettler;
use llm_relay::config::config_search_paths;
use llm_relay::{build_router, AppState, Channel, RelayConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-relay",
    about = "LLM API gateway: speak OpenAI, Claude or Gemini to any of them",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Provider name (overrides config)
    #[arg(long)]
    provider: Option<String>,

    /// Log file path
    #[arg(long, default_value = "llm-relay.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = RelayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ref provider) = cli.provider {
        config.provider.name = provider.clone();
        if let Some(preset) = llm_relay::providers::ProviderPreset::from_name(provider) {
            if config.provider.base_url.is_none() {
                config.provider.base_url = Some(preset.base_url.to_string());
            }
            config.provider.api_key_env = preset.default_api_key_env.to_string();
            config.provider.format = None;
        }
    }

    let logger = SharedLogger::new(&cli.log_file)?;

    // Validate config eagerly
    let channel = Channel::from_config(&config)?;

    info!("llm-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("  Provider:  {}", channel.name);
    info!("  Base URL:  {}", channel.base_url);
    info!("  Format:    {}", channel.format);
    info!("  Port:      {}", config.port);
    info!("  Models:    {} mapped", config.models.len());
    info!("  Log file:  {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting llm-relay provider={} format={} base_url={} port={}",
            channel.name, channel.format, channel.base_url, config.port
        ),
    );

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let state = Arc::new(AppState {
        config: config.clone(),
        channel,
        client,
        logger: logger.clone(),
        settler: Arc::new(LogSettler::new(logger)),
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  Claude clients:  ANTHROPIC_BASE_URL=http://localhost:{}", config.port);
    info!("  OpenAI clients:  OPENAI_BASE_URL=http://localhost:{}/v1", config.port);
    info!("  Gemini clients:  http://localhost:{}/v1beta", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
