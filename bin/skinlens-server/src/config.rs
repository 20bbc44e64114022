//! Server configuration, loaded from environment variables at startup and
//! optionally overridden from the command line.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use skinlens_core::{ModelConfig, ModelShape};

/// Command-line overrides. Anything not given here comes from the
/// environment (see [`Config::from_env`]).
#[derive(Debug, Default, Parser)]
#[command(name = "skinlens-server", version, about = "Skin image classification server")]
pub struct Cli {
    /// HTTP listen address, e.g. `0.0.0.0:8088`.
    #[arg(long)]
    pub http_bind: Option<String>,

    /// gRPC listen address, e.g. `0.0.0.0:8008`.
    #[arg(long)]
    pub grpc_bind: Option<String>,

    /// Path to the ONNX model file.
    #[arg(long = "model")]
    pub model_path: Option<PathBuf>,

    /// Path to the JSON class dictionary.
    #[arg(long = "classes")]
    pub class_dictionary_path: Option<PathBuf>,
}

/// Runtime configuration for skinlens-server.
///
/// Every field has a default so the server starts without any environment
/// variables set, provided the model files exist at the default paths.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (default: `"0.0.0.0:8088"`).
    pub http_bind: String,

    /// gRPC listen address (default: `"0.0.0.0:8008"`).
    pub grpc_bind: String,

    pub model_path: PathBuf,
    pub class_dictionary_path: PathBuf,

    /// Model graph input node (default: `"input_6"`).
    pub input_node: String,

    /// Model graph output node (default: `"dense_11"`).
    pub output_node: String,

    pub model_shape: ModelShape,

    /// sqlx SQLite URL (default: `"sqlite://skinlens.db"`).
    pub database_url: String,

    /// Audit-event queue capacity.
    pub event_queue_capacity: usize,

    /// How long components get to stop after a shutdown signal.
    pub shutdown_grace: Duration,

    /// Request body limit in bytes.
    pub max_body_bytes: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily-rolling log files; stdout only when unset.
    pub log_dir: Option<PathBuf>,

    /// Comma-separated allowed CORS origins; any origin when unset.
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = ModelShape::default();
        Self {
            http_bind: env_or("SKINLENS_HTTP_BIND", "0.0.0.0:8088"),
            grpc_bind: env_or("SKINLENS_GRPC_BIND", "0.0.0.0:8008"),
            model_path: env_or("SKINLENS_MODEL_PATH", "./models/model.onnx").into(),
            class_dictionary_path: env_or(
                "SKINLENS_CLASS_DICTIONARY_PATH",
                "./models/classes.json",
            )
            .into(),
            input_node: env_or("SKINLENS_INPUT_NODE", "input_6"),
            output_node: env_or("SKINLENS_OUTPUT_NODE", "dense_11"),
            model_shape: ModelShape::new(
                parse_env("SKINLENS_INPUT_HEIGHT", defaults.height),
                parse_env("SKINLENS_INPUT_WIDTH", defaults.width),
                parse_env("SKINLENS_INPUT_CHANNELS", defaults.channels),
                parse_env("SKINLENS_NUM_CLASSES", defaults.num_classes),
            ),
            database_url: env_or("SKINLENS_DATABASE_URL", "sqlite://skinlens.db"),
            event_queue_capacity: parse_env(
                "SKINLENS_EVENT_QUEUE_CAPACITY",
                skinlens_core::events::DEFAULT_CAPACITY,
            ),
            shutdown_grace: Duration::from_secs(parse_env("SKINLENS_SHUTDOWN_GRACE_SECS", 10)),
            max_body_bytes: megabytes(parse_env("SKINLENS_MAX_BODY_MB", 16)),
            log_level: env_or("SKINLENS_LOG", "info"),
            log_json: std::env::var("SKINLENS_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: std::env::var("SKINLENS_LOG_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            cors_allowed_origins: std::env::var("SKINLENS_CORS_ORIGINS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    /// Apply command-line overrides on top of the environment.
    pub fn with_cli(mut self, cli: Cli) -> Self {
        if let Some(v) = cli.http_bind {
            self.http_bind = v;
        }
        if let Some(v) = cli.grpc_bind {
            self.grpc_bind = v;
        }
        if let Some(v) = cli.model_path {
            self.model_path = v;
        }
        if let Some(v) = cli.class_dictionary_path {
            self.class_dictionary_path = v;
        }
        self
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_path: self.model_path.clone(),
            input_node: self.input_node.clone(),
            output_node: self.output_node.clone(),
            shape: self.model_shape,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn megabytes(mb: usize) -> usize {
    mb.saturating_mul(1024 * 1024)
}
