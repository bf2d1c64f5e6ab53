use anyhow::{Context, Result};
use apisdom::http::LogObserver;
use apisdom::{ApisdomClient, ClientConfig};
use clap::Parser;
use serde::Serialize;
use std::time::Duration;

/// apisdom - command-line client for the Apisdom APIs
///
/// Sentiment analysis, content moderation and time-series forecasting.
/// Transient failures (429, 5xx, network errors) are retried with backoff;
/// missing credits (402) and invalid keys (401) fail immediately.
///
/// Examples:
///   apisdom sentiment "I love this product"
///   apisdom forecast --dates 2024-01-01,... --values 100,105,... --periods 7
#[derive(Parser, Debug)]
#[command(author, version = env!("APISDOM_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API key from the Apisdom dashboard
    #[arg(
        long = "api-key",
        env = "APISDOM_API_KEY",
        value_name = "KEY",
        hide_env_values = true,
        global = true
    )]
    pub api_key: Option<String>,

    /// API base URL (defaults to https://apisdom.com)
    #[arg(
        long = "base-url",
        env = "APISDOM_BASE_URL",
        value_name = "URL",
        global = true
    )]
    pub base_url: Option<String>,

    /// Maximum number of attempts per request
    #[arg(long = "max-retries", value_name = "N", global = true)]
    pub max_retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    pub timeout: Option<u64>,

    /// Log each attempt (same as RUST_LOG=debug)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Classify the sentiment of a text
    Sentiment(TextArgs),

    /// Detect toxic content in a text
    Moderate(TextArgs),

    /// Forecast future values of a daily time series
    Forecast(ForecastArgs),
}

#[derive(clap::Args, Debug)]
pub struct TextArgs {
    /// Text to analyze (at most 5000 characters)
    #[arg(value_name = "TEXT")]
    pub text: String,
}

#[derive(clap::Args, Debug)]
pub struct ForecastArgs {
    /// Comma-separated dates in YYYY-MM-DD format (at least 10)
    #[arg(long, value_delimiter = ',', required = true)]
    pub dates: Vec<String>,

    /// Comma-separated values, one per date
    #[arg(long, value_delimiter = ',', required = true)]
    pub values: Vec<f64>,

    /// Number of future periods to predict (1-365)
    #[arg(long, default_value_t = 7)]
    pub periods: u32,
}

impl Cli {
    fn config(&self) -> Result<ClientConfig> {
        let api_key = self
            .api_key
            .clone()
            .context("No API key given. Pass --api-key or set APISDOM_API_KEY.")?;

        let mut config = ClientConfig::new(api_key);
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url);
        }
        if let Some(max_retries) = self.max_retries {
            config = config.with_max_retries(max_retries);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(Duration::from_secs(timeout));
        }
        Ok(config)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let client = ApisdomClient::new(&cli.config()?)?.with_observer(LogObserver);

    match cli.command {
        Commands::Sentiment(args) => print_json(&client.analyze_sentiment(&args.text).await?)?,
        Commands::Moderate(args) => print_json(&client.moderate_content(&args.text).await?)?,
        Commands::Forecast(args) => print_json(
            &client
                .forecast(&args.dates, &args.values, args.periods)
                .await?,
        )?,
    }
    Ok(())
}
