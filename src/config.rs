//! Configuration management for nimcall.
//!
//! Startup settings resolve in layers, highest precedence first: explicit
//! flag, `NIM_*` environment variable, optional TOML file at
//! `~/.config/nimcall/config.toml`, built-in default. Every key in the file
//! is optional. The resolved [`ClientConfig`] is immutable for the process
//! lifetime.

use crate::cache::{read_json_artifact, read_text_artifact};
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/v1";
pub const DEFAULT_MODEL: &str = "meta/llama-3.2-3b-instruct";
pub const DEFAULT_API_KEY: &str = "not-used";

/// The decoding constraint type a client instance is fixed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StructuredMode {
    /// Constrain decoding with a formal grammar (`guided_grammar`).
    Grammar,
    /// Constrain decoding with a JSON Schema (`guided_json`).
    Json,
}

impl fmt::Display for StructuredMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StructuredMode::Grammar => "grammar",
            StructuredMode::Json => "json",
        })
    }
}

/// The default decoding constraint, loaded once at startup.
///
/// Holding the mode and its artifact in one value keeps the "exactly one of
/// grammar/schema, matching the mode" invariant true by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Grammar(String),
    Schema(Value),
}

/// File-level configuration. All fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Structured mode: "grammar" or "json".
    pub mode: Option<StructuredMode>,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub artifacts: ArtifactPaths,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

/// `[endpoint]` section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// `[artifacts]` section: paths to the default prompt and constraint files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactPaths {
    pub system: Option<PathBuf>,
    pub assistant: Option<PathBuf>,
    pub grammar: Option<PathBuf>,
    pub json_schema: Option<PathBuf>,
}

/// `[sampling]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SamplingConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Starter config written by `nimcall config`. Every key is commented out.
const TEMPLATE: &str = r#"# nimcall configuration.
# Precedence: command-line flag > NIM_* environment variable > this file.

# mode = "grammar"

[endpoint]
# base_url = "http://127.0.0.1:8000/v1"
# api_key = "not-used"
# model = "meta/llama-3.2-3b-instruct"

[artifacts]
# system = "/path/to/system_prompt.txt"
# assistant = "/path/to/assistant_prompt.txt"
# grammar = "/path/to/command_schema.ebnf"
# json_schema = "/path/to/schema.json"

[sampling]
# temperature = 0.0
# max_tokens = 512
"#;

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("nimcall"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, using defaults if not found.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Write the starter template, creating the config directory if needed.
    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        fs::write(path, TEMPLATE)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

/// One layer of startup overrides, from flags or from the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub mode: Option<StructuredMode>,
    pub system: Option<PathBuf>,
    pub assistant: Option<PathBuf>,
    pub grammar: Option<PathBuf>,
    pub json_schema: Option<PathBuf>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Overrides {
    /// Overrides carried by the `NIM_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("NIM_BASE_URL").ok(),
            api_key: std::env::var("NIM_API_KEY").ok(),
            model: std::env::var("NIM_MODEL_NAME").ok(),
            ..Self::default()
        }
    }

    /// Layer two override sets, preferring `self` field by field.
    pub fn or(self, fallback: Self) -> Self {
        Self {
            base_url: self.base_url.or(fallback.base_url),
            api_key: self.api_key.or(fallback.api_key),
            model: self.model.or(fallback.model),
            mode: self.mode.or(fallback.mode),
            system: self.system.or(fallback.system),
            assistant: self.assistant.or(fallback.assistant),
            grammar: self.grammar.or(fallback.grammar),
            json_schema: self.json_schema.or(fallback.json_schema),
            temperature: self.temperature.or(fallback.temperature),
            max_tokens: self.max_tokens.or(fallback.max_tokens),
        }
    }
}

/// Fully resolved client configuration, constructed once at startup.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Default system prompt; a per-request override replaces it.
    pub system_text: Option<String>,
    /// Default assistant prompt; a per-request override replaces it.
    pub assistant_text: Option<String>,
    /// Default decoding constraint for the fixed mode.
    pub constraint: Constraint,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ClientConfig {
    /// Resolve the layered configuration and load the default artifacts.
    ///
    /// Fails if a named prompt file cannot be read, or if the mode's
    /// required constraint artifact is missing, unreadable, or empty.
    pub fn resolve(overrides: Overrides, file: Config) -> Result<Self> {
        let (base_url, api_key, model) = resolve_endpoint(&overrides, &file);
        let mode = overrides
            .mode
            .or(file.mode)
            .unwrap_or(StructuredMode::Grammar);

        let system_text = match overrides.system.or(file.artifacts.system) {
            Some(path) => Some(read_prompt(&path)?),
            None => None,
        };
        let assistant_text = match overrides.assistant.or(file.artifacts.assistant) {
            Some(path) => Some(read_prompt(&path)?),
            None => None,
        };

        let constraint = match mode {
            StructuredMode::Grammar => {
                let path = overrides.grammar.or(file.artifacts.grammar).context(
                    "Grammar file required in grammar mode (--grammar or [artifacts] grammar)",
                )?;
                Constraint::Grammar(
                    read_text_artifact(&path).context("Failed to load default grammar")?,
                )
            }
            StructuredMode::Json => {
                let path = overrides.json_schema.or(file.artifacts.json_schema).context(
                    "JSON Schema file required in json mode (--json-schema or [artifacts] json_schema)",
                )?;
                Constraint::Schema(
                    read_json_artifact(&path).context("Failed to load default schema")?,
                )
            }
        };

        Ok(Self {
            base_url,
            api_key,
            model,
            system_text,
            assistant_text,
            constraint,
            temperature: overrides
                .temperature
                .or(file.sampling.temperature)
                .unwrap_or(0.0),
            max_tokens: overrides.max_tokens.or(file.sampling.max_tokens),
        })
    }

    /// The structured mode implied by the default constraint.
    pub fn mode(&self) -> StructuredMode {
        match self.constraint {
            Constraint::Grammar(_) => StructuredMode::Grammar,
            Constraint::Schema(_) => StructuredMode::Json,
        }
    }
}

/// Resolve the endpoint triple (base URL, API key, model) across layers.
fn resolve_endpoint(overrides: &Overrides, file: &Config) -> (String, String, String) {
    (
        overrides
            .base_url
            .clone()
            .or_else(|| file.endpoint.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        overrides
            .api_key
            .clone()
            .or_else(|| file.endpoint.api_key.clone())
            .unwrap_or_else(|| DEFAULT_API_KEY.to_string()),
        overrides
            .model
            .clone()
            .or_else(|| file.endpoint.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
    )
}

fn read_prompt(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file: {}", path.display()))
}
