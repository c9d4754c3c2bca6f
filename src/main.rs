//! nimcall - a latency-focused structured-output bridge to an
//! OpenAI-compatible endpoint.
//!
//! Loads prompts and a grammar or JSON Schema once, then answers requests
//! with a single constrained chat-completion call each. One-shot mode prints
//! one JSON line for one prompt; serve mode answers newline-delimited JSON
//! requests on stdin until told to quit. Stdout carries only response lines;
//! all diagnostics go to stderr.

mod cache;
mod client;
mod config;
mod protocol;
mod server;

use anyhow::{Context, Result};
use cache::ArtifactCache;
use clap::{Parser, Subcommand};
use client::{HttpEndpoint, StructuredClient};
use config::{Config, Overrides, StructuredMode};
use protocol::{ErrorKind, Request};
use serde_json::Value;
use server::RequestServer;
use std::path::PathBuf;
use std::process::Command as ProcessCommand;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nimcall")]
#[command(author, version, about = "Structured-output client for an OpenAI-compatible endpoint")]
#[command(
    long_about = "Calls an OpenAI-compatible chat endpoint with guided decoding, so the model's\noutput always parses as JSON.\n\nOne-shot:   nimcall \"open the door\"\nPersistent: nimcall serve   (one JSON request per stdin line, one response line each)"
)]
struct Cli {
    /// One-shot user prompt; prints a single JSON response line
    #[arg(value_name = "PROMPT")]
    prompt: Option<String>,

    /// Endpoint base URL (default: NIM_BASE_URL or http://127.0.0.1:8000/v1)
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// API key (default: NIM_API_KEY; local endpoints often ignore it)
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    /// Model name (default: NIM_MODEL_NAME or meta/llama-3.2-3b-instruct)
    #[arg(short, long, value_name = "MODEL")]
    model: Option<String>,

    /// Structured mode: constrain decoding with a grammar or a JSON Schema
    #[arg(long, value_enum)]
    mode: Option<StructuredMode>,

    /// Path to the default system prompt file
    #[arg(long, value_name = "FILE")]
    system: Option<PathBuf>,

    /// Path to the default assistant prompt file
    #[arg(long, value_name = "FILE")]
    assistant: Option<PathBuf>,

    /// Path to the default grammar file (mode=grammar)
    #[arg(long, value_name = "FILE")]
    grammar: Option<PathBuf>,

    /// Path to the default JSON Schema file (mode=json)
    #[arg(long, value_name = "FILE")]
    json_schema: Option<PathBuf>,

    /// Sampling temperature (default: 0.0)
    #[arg(long, value_name = "T")]
    temperature: Option<f32>,

    /// Maximum output tokens
    #[arg(long, value_name = "N")]
    max_tokens: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve newline-delimited JSON requests on stdin until quit
    Serve,
    /// Probe the endpoint's model listing and report reachability
    Check,
    /// Open the configuration file in $EDITOR
    Config,
}

impl Cli {
    /// Flag-level overrides, the highest-precedence configuration layer.
    fn overrides(&self) -> Overrides {
        Overrides {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            mode: self.mode,
            system: self.system.clone(),
            assistant: self.assistant.clone(),
            grammar: self.grammar.clone(),
            json_schema: self.json_schema.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            2
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Some(Commands::Serve) => handle_serve(cli).await,
        Some(Commands::Check) => handle_check(cli).await,
        Some(Commands::Config) => handle_config(),
        None => handle_one_shot(cli).await,
    }
}

/// Logging goes to stderr only; stdout is reserved for response lines.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nimcall=info".parse().unwrap())
                .add_directive("reqwest=warn".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<config::ClientConfig> {
    let file = Config::load().context("Failed to load configuration")?;
    let overrides = cli.overrides().or(Overrides::from_env());
    config::ClientConfig::resolve(overrides, file)
}

/// Run the persistent stdin server.
async fn handle_serve(cli: Cli) -> Result<i32> {
    let config = resolve_config(&cli)?;
    let client = StructuredClient::new(config)?;
    let mut server = RequestServer::new(client);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    server.run(stdin, tokio::io::stdout()).await?;
    Ok(0)
}

/// Answer one prompt, print one line, exit.
async fn handle_one_shot(cli: Cli) -> Result<i32> {
    let Some(prompt) = cli.prompt.clone() else {
        anyhow::bail!("A prompt is required (or run 'nimcall serve')");
    };
    let config = resolve_config(&cli)?;

    let client = StructuredClient::new(config)?;
    let request = Request {
        user: prompt,
        ..Request::default()
    };
    let mut cache = ArtifactCache::new();
    let mut stdout = tokio::io::stdout();

    match client.infer(&request, &mut cache).await {
        Ok(value) => {
            server::write_line(&mut stdout, &value).await?;
            Ok(0)
        }
        Err(body) => {
            // A non_json_output envelope is still a well-formed answer; only
            // an exception counts as a failed run.
            let code = match body.error {
                ErrorKind::Exception => 2,
                _ => 0,
            };
            server::write_line(&mut stdout, &Value::from(body)).await?;
            Ok(code)
        }
    }
}

/// Resolve the full configuration, then probe the endpoint.
async fn handle_check(cli: Cli) -> Result<i32> {
    let config = resolve_config(&cli)?;
    let endpoint = HttpEndpoint::new(&config)?;

    println!("Endpoint: {}", config.base_url);
    println!("Model:    {}", config.model);
    println!("Mode:     {}", config.mode());

    match endpoint.probe().await {
        Ok(()) => {
            println!("Status:   reachable");
            Ok(0)
        }
        Err(err) => {
            println!("Status:   unreachable");
            eprintln!("Endpoint check failed: {:#}", err);
            Ok(2)
        }
    }
}

/// Open the config file in $EDITOR, creating a starter template first.
fn handle_config() -> Result<i32> {
    let config_path = Config::config_path()?;

    if !config_path.exists() {
        Config::write_template(&config_path)?;
        println!("Created starter config at {}", config_path.display());
    }

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = ProcessCommand::new(&editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        eprintln!("Editor exited with non-zero status");
    }

    Ok(0)
}
