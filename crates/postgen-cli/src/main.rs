//! `postgen`: generate LinkedIn posts from the command line.

mod render;

use std::io;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use postgen_client::{GenerationClient, StreamController, StreamOutcome};
use postgen_core::prelude::*;

use crate::render::Renderer;

/// Exit status after Ctrl-C, as shells report SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "postgen")]
#[command(about = "Generate LinkedIn posts with live agent progress")]
#[command(version)]
struct Cli {
    /// Base URL of the generation service [env: POSTGEN_API_URL]
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Connect timeout in seconds [env: POSTGEN_CONNECT_TIMEOUT_SECS]
    #[arg(long, global = true)]
    connect_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a post, showing the agent's steps as they happen
    Generate {
        topic: String,

        /// Print the final state as JSON instead of progress
        #[arg(long)]
        json: bool,
    },
    /// Generate a post in a single request
    Post { topic: String },
    /// Check that the generation service is up
    Health,
}

impl Command {
    fn json(&self) -> bool {
        matches!(self, Command::Generate { json: true, .. })
    }
}

fn setup_logging(json: bool) {
    let default = if json {
        "warn"
    } else {
        "postgen=info,postgen_client=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .init();
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.api_url {
        config = config.with_base_url(url.as_str());
    }
    if let Some(secs) = cli.connect_timeout {
        config = config.with_connect_timeout_secs(secs);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.command.json());

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return ExitCode::FAILURE;
        }
    };
    debug!(base_url = %config.base_url, "Loaded configuration");

    let result = match cli.command {
        Command::Generate { topic, json } => generate(config, &topic, json).await,
        Command::Post { topic } => post(config, &topic).await,
        Command::Health => health(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

async fn generate(config: ClientConfig, topic: &str, json: bool) -> Result<ExitCode> {
    let client = GenerationClient::new(config)?;
    let (controller, mut updates) = StreamController::new(client);

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling stream");
            token.cancel();
        }
    });

    let mut renderer = Renderer::new(io::stdout(), json);
    renderer.begin(topic).map_err(output_error)?;
    let drawing = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            if let Err(e) = renderer.apply(&update) {
                warn!(error = %e, "Could not draw update");
            }
        }
        renderer
    });

    let outcome = controller.start(topic).await;
    // Closes the update channel so the drawing task drains and returns.
    drop(controller);
    let mut renderer = drawing
        .await
        .map_err(|e| PostgenError::Other(format!("render task failed: {e}")))?;

    match outcome {
        Ok(StreamOutcome::Completed(state) | StreamOutcome::Ended(state)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                renderer.finish(&state).map_err(output_error)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Ok(StreamOutcome::Cancelled) => {
            eprintln!("Cancelled.");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Ok(StreamOutcome::AlreadyStarted) => Ok(ExitCode::SUCCESS),
        // Already shown through the update channel.
        Err(e) if renderer.failure().is_some() && !json => {
            debug!(error = %e, "Stream failed");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e),
    }
}

async fn post(config: ClientConfig, topic: &str) -> Result<ExitCode> {
    let client = GenerationClient::new(config)?;
    println!("Generating post for '{topic}'...");
    let post = client.generate_post(topic).await?;

    println!();
    println!("{}", post.linkedin_post);
    if !post.news_sources.is_empty() {
        println!();
        println!("Sources");
        for (i, source) in post.news_sources.iter().enumerate() {
            println!("  {}. {} <{}>", i + 1, source.title, source.link);
        }
    }
    if !post.image_suggestion.is_empty() {
        println!();
        println!("Image idea: {}", post.image_suggestion);
    }
    Ok(ExitCode::SUCCESS)
}

async fn health(config: ClientConfig) -> Result<ExitCode> {
    let base_url = config.base_url.clone();
    let client = GenerationClient::new(config)?;
    if client.health().await? {
        println!("{base_url}: ok");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{base_url}: unhealthy");
        Ok(ExitCode::FAILURE)
    }
}

fn output_error(e: io::Error) -> PostgenError {
    PostgenError::Other(format!("could not write output: {e}"))
}

