//! Binary entry point for `relay-bot`.
//!
//! Parses the command line, sets up logging (stdout, plus an optional OTLP
//! exporter), loads the configuration, and either validates it or runs the bot.

use clap::Parser;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use relay_bot::{
    base::{config::Config, types::Void},
    service::roles::{GenericRoleCatalog, RoleCatalog},
};
use tracing::{Level, info};
use tracing_subscriber::{filter::LevelFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt};

/// Relay-bot: an OpenAI chat assistant for Slack.
///
/// Configuration can come from `config.toml` or `RELAY_BOT_*` environment variables.
/// The bot answers direct messages and mentions in threads, keeping one
/// conversation per thread, and understands a handful of built-in commands
/// (send `/help` to list them).
#[derive(Parser, Debug)]
#[command(version, author, about, long_about = None)]
struct Args {
    /// Override the config file path (optional).
    ///
    /// By default, the bot will look for a config file at `.hidden/config.toml`
    /// in the current directory.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
    /// Increase log verbosity (-v, -vv, etc.).
    ///
    /// - No flag: INFO level
    /// - -v: DEBUG level
    /// - -vv or more: TRACE level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Export spans over OTLP/HTTP (endpoint from `OTEL_EXPORTER_OTLP_ENDPOINT`).
    #[arg(long)]
    otlp: bool,
    /// Load and validate the config and role list, print a summary, and exit without connecting.
    #[arg(long)]
    check_config: bool,
}

/// Main entry point for the relay-bot binary.
#[tokio::main]
async fn main() -> Void {
    let args = Args::parse();

    init_tracing(&args)?;

    let config = Config::load(args.config.as_deref())?;

    if args.check_config {
        return check_config(&config);
    }

    relay_bot::start(config).await
}

fn level_for(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn init_tracing(args: &Args) -> Void {
    let level_filter = LevelFilter::from_level(level_for(args.verbose));

    let stdout = tracing_subscriber::fmt::layer()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_file(false)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    // `None` is a no-op layer.
    let otel = if args.otlp {
        let exporter = opentelemetry_otlp::SpanExporter::builder().with_http().with_protocol(Protocol::HttpBinary).build()?;
        let tracer = opentelemetry_sdk::trace::SdkTracerProvider::builder().with_simple_exporter(exporter).build().tracer("relay-bot");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry().with(otel).with(level_filter).with(stdout).init();

    Ok(())
}

/// Log what the bot would run with. Secrets are only reported as set or missing.
fn check_config(config: &Config) -> Void {
    let roles = RoleCatalog::from_file(&config.roles_path)?;
    let set_or_missing = |value: &str| if value.is_empty() { "missing" } else { "set" };

    info!("Model: {} ({} max tokens) at {}.", config.openai_model, config.openai_max_tokens, config.openai_api_base);
    info!(
        "Timeouts: {}s per call, {}s per OpenAI attempt.",
        config.call_timeout.as_secs(),
        config.openai_request_timeout.as_secs()
    );
    info!("Cache TTLs: {}s dedup, {}s sessions.", config.dedup_ttl.as_secs(), config.session_ttl.as_secs());
    info!("Roles: {} tags from `{}`.", roles.all_unique_tags().len(), config.roles_path.display());
    info!(
        "Tokens: OpenAI key {}, Slack app token {}, Slack bot token {}.",
        set_or_missing(&config.openai_api_key),
        set_or_missing(&config.slack_app_token),
        set_or_missing(&config.slack_bot_token)
    );

    Ok(())
}

// Tests.
