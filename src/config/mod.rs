//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::render::RENDERER_AGENT;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "prerender";
const ENV_PREFIX: &str = "PRERENDER";
const DEFAULT_PAGE_LOAD_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SCRIPT_DRAIN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1024;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Command-line arguments for the prerender binary.
#[derive(Debug, Parser)]
#[command(
    name = "prerender",
    version,
    about = "Server-side rendering bridge for crawlers"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PRERENDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Report whether a request would be rendered for a crawler.
    Check(CheckArgs),
    /// Render one URL through the pass-through engine and the outbound client.
    Fetch(FetchArgs),
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: RendererOverrides,

    /// Request target (path and optional query) to test.
    #[arg(long, value_name = "TARGET", default_value = "/")]
    pub path: String,

    /// User-Agent header value to test; omitted means the header is absent.
    #[arg(long = "user-agent", value_name = "UA")]
    pub user_agent: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    #[command(flatten)]
    pub overrides: RendererOverrides,

    /// Absolute URL to render.
    #[arg(value_name = "URL")]
    pub url: String,

    /// User-Agent forwarded with the top-level request.
    #[arg(long = "user-agent", value_name = "UA")]
    pub user_agent: Option<String>,

    /// Write the rendered document to stdout.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub print: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RendererOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the force-render path pattern.
    #[arg(long = "force-path", value_name = "REGEX")]
    pub force_path: Option<String>,

    /// Additional crawler signature; may be repeated.
    #[arg(long = "agent", value_name = "REGEX")]
    pub agents: Vec<String>,

    /// Toggle development mode.
    #[arg(
        long = "development",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub development: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub renderer: RendererSettings,
    pub cache: CacheSettings,
    pub http_client: HttpClientSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub agents: Vec<String>,
    pub force_path: Option<String>,
    pub development: bool,
    pub warmup: bool,
    pub user_agent: String,
    pub throw_on_script_error: bool,
    pub page_load_timeout: Duration,
    pub script_drain_timeout: Duration,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: NonZeroUsize,
    /// `None` keeps entries until evicted by capacity.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    pub timeout: Duration,
    pub follow_redirects: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Check(args) => raw.apply_renderer_overrides(&args.overrides),
        Command::Fetch(args) => raw.apply_renderer_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    renderer: RawRendererSettings,
    cache: RawCacheSettings,
    http_client: RawHttpClientSettings,
}

impl RawSettings {
    fn apply_renderer_overrides(&mut self, overrides: &RendererOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(pattern) = overrides.force_path.as_ref() {
            self.renderer.force_path = Some(pattern.clone());
        }
        if !overrides.agents.is_empty() {
            self.renderer
                .agents
                .get_or_insert_with(Vec::new)
                .extend(overrides.agents.iter().cloned());
        }
        if let Some(development) = overrides.development {
            self.renderer.development = Some(development);
        }
    }
}

impl Settings {
    /// Settings with every key at its built-in default.
    pub fn defaults() -> Result<Self, LoadError> {
        Self::from_raw(RawSettings::default())
    }

    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            renderer,
            cache,
            http_client,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let renderer = build_renderer_settings(renderer)?;
        let cache = build_cache_settings(cache)?;
        let http_client = build_http_client_settings(http_client)?;

        Ok(Self {
            logging,
            renderer,
            cache,
            http_client,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let agents = renderer.agents.unwrap_or_default();
    for agent in &agents {
        Regex::new(agent).map_err(|err| {
            LoadError::invalid("renderer.agents", format!("`{agent}` is not a valid pattern: {err}"))
        })?;
    }

    let force_path = renderer.force_path.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(pattern) = force_path.as_deref() {
        Regex::new(pattern).map_err(|err| {
            LoadError::invalid("renderer.force_path", format!("invalid pattern: {err}"))
        })?;
    }

    let user_agent = renderer
        .user_agent
        .and_then(|value| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| RENDERER_AGENT.to_string());

    let page_load_ms = non_zero_u64(
        renderer
            .page_load_timeout_ms
            .unwrap_or(DEFAULT_PAGE_LOAD_TIMEOUT_MS),
        "renderer.page_load_timeout_ms",
    )?;
    let drain_ms = renderer
        .script_drain_timeout_ms
        .unwrap_or(DEFAULT_SCRIPT_DRAIN_TIMEOUT_MS);
    let max_body_bytes = non_zero_usize(
        renderer.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "renderer.max_body_bytes",
    )?;

    Ok(RendererSettings {
        agents,
        force_path,
        development: renderer.development.unwrap_or(false),
        warmup: renderer.warmup.unwrap_or(true),
        user_agent,
        throw_on_script_error: renderer.throw_on_script_error.unwrap_or(true),
        page_load_timeout: Duration::from_millis(page_load_ms.get()),
        script_drain_timeout: Duration::from_millis(drain_ms),
        max_body_bytes,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
        "cache.max_entries",
    )?;
    let ttl = match cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS) {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        max_entries,
        ttl,
    })
}

fn build_http_client_settings(
    http_client: RawHttpClientSettings,
) -> Result<HttpClientSettings, LoadError> {
    let timeout = non_zero_u64(
        http_client
            .timeout_seconds
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        "http_client.timeout_seconds",
    )?;

    Ok(HttpClientSettings {
        timeout: Duration::from_secs(timeout.get()),
        follow_redirects: http_client.follow_redirects.unwrap_or(true),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    agents: Option<Vec<String>>,
    force_path: Option<String>,
    development: Option<bool>,
    warmup: Option<bool>,
    user_agent: Option<String>,
    throw_on_script_error: Option<bool>,
    page_load_timeout_ms: Option<u64>,
    script_drain_timeout_ms: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    max_entries: Option<u64>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpClientSettings {
    timeout_seconds: Option<u64>,
    follow_redirects: Option<bool>,
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize)
        .ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
