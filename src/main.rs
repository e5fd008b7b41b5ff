// src/main.rs
use anyhow::{Context, Result};
use campus_api_client::{
    api::{ApiClient, ApiRequest, Method, RequestDescriptor},
    config::{load_config, Config},
    utils::setup_logging,
    ApiError,
};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "campus-api", version, about = "Issue requests through the campus API pipeline")]
struct Cli {
    /// Bearer token (overrides API_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// GET an endpoint, cache-first unless --no-cache
    Get {
        endpoint: String,
        #[arg(long)]
        no_cache: bool,
    },
    Post {
        endpoint: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    Put {
        endpoint: String,
        #[arg(long)]
        body: Option<String>,
    },
    Patch {
        endpoint: String,
        #[arg(long)]
        body: Option<String>,
    },
    Delete {
        endpoint: String,
        #[arg(long)]
        body: Option<String>,
    },
    /// Remove every fallback cache entry
    ClearCache,
}

fn build_request(command: &Command) -> Result<Option<ApiRequest>> {
    let (method, endpoint, body) = match command {
        Command::Get { endpoint, no_cache } => {
            let request = ApiRequest::get(endpoint);
            return Ok(Some(if *no_cache {
                request.without_cache()
            } else {
                request
            }));
        }
        Command::Post { endpoint, body } => (Method::Post, endpoint, body),
        Command::Put { endpoint, body } => (Method::Put, endpoint, body),
        Command::Patch { endpoint, body } => (Method::Patch, endpoint, body),
        Command::Delete { endpoint, body } => (Method::Delete, endpoint, body),
        Command::ClearCache => return Ok(None),
    };

    let mut descriptor = RequestDescriptor::new(method, endpoint);
    if let Some(raw) = body {
        let value: Value = serde_json::from_str(raw).context("--body must be valid JSON")?;
        descriptor = descriptor.with_json_body(&value)?;
    }
    Ok(Some(ApiRequest::new(descriptor)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    setup_logging(level).context("Failed to initialize logging")?;

    let mut config = Config::clone(&*load_config()?);
    if cli.token.is_some() {
        config.api_token = cli.token.clone();
    }
    let client = ApiClient::from_config(&config)?;

    let request = match build_request(&cli.command)? {
        Some(request) => request,
        None => {
            client.cache().clear().await;
            return Ok(());
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling request");
            on_interrupt.cancel();
        }
    });

    let outcome = client.request_with_meta::<Value>(&request, &cancel).await;
    info!("{}", client.stats());

    match outcome {
        Ok(response) => {
            info!(
                "✅ {:?} response in {}ms",
                response.source,
                response.latency.as_millis()
            );
            println!("{}", serde_json::to_string_pretty(&response.data)?);
            if let Some(pagination) = response.pagination {
                info!("📄 pagination: {}", serde_json::to_string(&pagination)?);
            }
            Ok(())
        }
        Err(ApiError::Cancelled) => Ok(()),
        Err(err) => {
            eprintln!("{}", err.user_message());
            Err(err.into())
        }
    }
}
