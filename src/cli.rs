use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    env,
    io::{self, Write},
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::opstail_backend::{router, MemoryBackend};
use crate::opstail_core::{Filters, LogEntry, PeriodPreset, TimeWindow};
use crate::opstail_demo::{demo_seed, run_demo, seed_backend, DemoGenerator};
use crate::opstail_http::HttpLogSource;
use crate::opstail_protocol::{FetchError, LogSource, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::opstail_stream::{
    LogStream, StreamConfig, StreamDriver, StreamSnapshot, DEFAULT_CURSOR_MAX_AGE,
    DEFAULT_NEAR_BOTTOM_THRESHOLD, DEFAULT_POLL_INTERVAL,
};

const CONFIG_FILE: &str = "opstail.json";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7400;
const DEFAULT_DEMO_HISTORY: usize = 400;
const MESSAGE_PREVIEW: usize = 160;
const PRINTED_ID_CAPACITY: usize = 10_000;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "opstail", version, about = "Tail operation and message logs")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Base url of a search backend to tail.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    env: Option<String>,
    #[arg(long)]
    auth_token: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    page_limit: Option<usize>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    #[arg(long)]
    near_bottom_px: Option<f64>,
    #[arg(long)]
    cursor_max_age_ms: Option<u64>,
    /// `operations` or `messages`.
    #[arg(long)]
    stream: Option<String>,
    #[arg(long)]
    operation_id: Option<String>,
    #[arg(long)]
    search: Option<String>,
    /// Preset such as `last1h` or `last24h`.
    #[arg(long)]
    window: Option<String>,
    #[arg(long = "state")]
    states: Vec<String>,
    #[arg(long = "type")]
    types: Vec<String>,
    #[arg(long = "integration")]
    integrations: Vec<String>,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    live: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_live: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    demo: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    serve: bool,
}

#[derive(Debug, Clone)]
struct Config {
    url: Option<String>,
    env: Option<String>,
    auth_token: Option<String>,
    host: String,
    port: u16,
    allow_remote: bool,
    page_limit: usize,
    poll_interval_ms: u64,
    near_bottom_px: f64,
    cursor_max_age_ms: u64,
    stream: String,
    operation_id: Option<String>,
    search: Option<String>,
    window: String,
    states: Vec<String>,
    types: Vec<String>,
    integrations: Vec<String>,
    live: bool,
    demo: bool,
    serve: bool,
}

#[derive(Debug, Default, Clone)]
struct PartialConfig {
    url: Option<String>,
    env: Option<String>,
    auth_token: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    allow_remote: Option<bool>,
    page_limit: Option<usize>,
    poll_interval_ms: Option<u64>,
    near_bottom_px: Option<f64>,
    cursor_max_age_ms: Option<u64>,
    stream: Option<String>,
    operation_id: Option<String>,
    search: Option<String>,
    window: Option<String>,
    states: Option<Vec<String>>,
    types: Option<Vec<String>>,
    integrations: Option<Vec<String>>,
    live: Option<bool>,
    demo: Option<bool>,
    serve: Option<bool>,
}

impl PartialConfig {
    fn merge(&mut self, other: PartialConfig) {
        if other.url.is_some() {
            self.url = other.url;
        }
        if other.env.is_some() {
            self.env = other.env;
        }
        if other.auth_token.is_some() {
            self.auth_token = other.auth_token;
        }
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.allow_remote.is_some() {
            self.allow_remote = other.allow_remote;
        }
        if other.page_limit.is_some() {
            self.page_limit = other.page_limit;
        }
        if other.poll_interval_ms.is_some() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.near_bottom_px.is_some() {
            self.near_bottom_px = other.near_bottom_px;
        }
        if other.cursor_max_age_ms.is_some() {
            self.cursor_max_age_ms = other.cursor_max_age_ms;
        }
        if other.stream.is_some() {
            self.stream = other.stream;
        }
        if other.operation_id.is_some() {
            self.operation_id = other.operation_id;
        }
        if other.search.is_some() {
            self.search = other.search;
        }
        if other.window.is_some() {
            self.window = other.window;
        }
        if other.states.is_some() {
            self.states = other.states;
        }
        if other.types.is_some() {
            self.types = other.types;
        }
        if other.integrations.is_some() {
            self.integrations = other.integrations;
        }
        if other.live.is_some() {
            self.live = other.live;
        }
        if other.demo.is_some() {
            self.demo = other.demo;
        }
        if other.serve.is_some() {
            self.serve = other.serve;
        }
    }
}

impl Config {
    fn from_partial(partial: PartialConfig) -> Self {
        Self {
            url: partial.url,
            env: partial.env,
            auth_token: partial.auth_token,
            host: partial.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: partial.port.unwrap_or(DEFAULT_PORT),
            allow_remote: partial.allow_remote.unwrap_or(false),
            page_limit: partial.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            poll_interval_ms: partial
                .poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL.as_millis() as u64),
            near_bottom_px: partial.near_bottom_px.unwrap_or(DEFAULT_NEAR_BOTTOM_THRESHOLD),
            cursor_max_age_ms: partial
                .cursor_max_age_ms
                .unwrap_or(DEFAULT_CURSOR_MAX_AGE.as_millis() as u64),
            stream: partial.stream.unwrap_or_else(|| "operations".to_string()),
            operation_id: partial.operation_id,
            search: partial.search.filter(|search| !search.trim().is_empty()),
            window: partial.window.unwrap_or_else(|| PeriodPreset::Last24h.name().to_string()),
            states: partial.states.unwrap_or_default(),
            types: partial.types.unwrap_or_default(),
            integrations: partial.integrations.unwrap_or_default(),
            live: partial.live.unwrap_or(true),
            demo: partial.demo.unwrap_or(false),
            serve: partial.serve.unwrap_or(false),
        }
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            page_limit: self.page_limit,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            near_bottom_threshold: self.near_bottom_px,
            cursor_max_age: Duration::from_millis(self.cursor_max_age_ms),
        }
    }

    fn filters(&self) -> Result<Filters, ConfigError> {
        let preset = PeriodPreset::parse(&self.window)
            .ok_or_else(|| ConfigError::Invalid { name: "window".to_string(), value: self.window.clone() })?;
        let base = match self.stream.trim().to_ascii_lowercase().as_str() {
            "operations" => Filters::operations(),
            "messages" => match &self.operation_id {
                Some(operation_id) => Filters::messages(operation_id.clone()),
                None => {
                    return Err(ConfigError::Invalid {
                        name: "operation_id".to_string(),
                        value: "required when stream is messages".to_string(),
                    })
                }
            },
            _ => return Err(ConfigError::Invalid { name: "stream".to_string(), value: self.stream.clone() }),
        };
        Ok(Filters {
            states: self.states.clone(),
            types: self.types.clone(),
            integrations: self.integrations.clone(),
            window: TimeWindow::relative(preset),
            search: self.search.clone(),
            ..base
        })
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    url: Option<String>,
    env: Option<String>,
    #[serde(alias = "authToken", alias = "token")]
    auth_token: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    #[serde(alias = "allowRemote")]
    allow_remote: Option<bool>,
    #[serde(alias = "pageLimit")]
    page_limit: Option<usize>,
    #[serde(alias = "pollIntervalMs")]
    poll_interval_ms: Option<u64>,
    #[serde(alias = "nearBottomPx")]
    near_bottom_px: Option<f64>,
    #[serde(alias = "cursorMaxAgeMs")]
    cursor_max_age_ms: Option<u64>,
    stream: Option<String>,
    #[serde(alias = "operationId")]
    operation_id: Option<String>,
    search: Option<String>,
    window: Option<String>,
    states: Option<Vec<String>>,
    types: Option<Vec<String>>,
    integrations: Option<Vec<String>>,
    live: Option<bool>,
    demo: Option<bool>,
    serve: Option<bool>,
}

impl FileConfig {
    fn into_partial(self) -> PartialConfig {
        PartialConfig {
            url: self.url,
            env: self.env,
            auth_token: self.auth_token,
            host: self.host,
            port: self.port,
            allow_remote: self.allow_remote,
            page_limit: self.page_limit,
            poll_interval_ms: self.poll_interval_ms,
            near_bottom_px: self.near_bottom_px,
            cursor_max_age_ms: self.cursor_max_age_ms,
            stream: self.stream,
            operation_id: self.operation_id,
            search: self.search,
            window: self.window,
            states: self.states,
            types: self.types,
            integrations: self.integrations,
            live: self.live,
            demo: self.demo,
            serve: self.serve,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid {name}: {value}")]
    Invalid { name: String, value: String },
}

fn cli_overrides(cli: &Cli) -> PartialConfig {
    let live = if cli.no_live {
        Some(false)
    } else if cli.live {
        Some(true)
    } else {
        None
    };
    let list = |values: &Vec<String>| (!values.is_empty()).then(|| values.clone());
    PartialConfig {
        url: cli.url.clone(),
        env: cli.env.clone(),
        auth_token: cli.auth_token.clone(),
        host: cli.host.clone(),
        port: cli.port,
        page_limit: cli.page_limit,
        poll_interval_ms: cli.poll_interval_ms,
        near_bottom_px: cli.near_bottom_px,
        cursor_max_age_ms: cli.cursor_max_age_ms,
        stream: cli.stream.clone(),
        operation_id: cli.operation_id.clone(),
        search: cli.search.clone(),
        window: cli.window.clone(),
        states: list(&cli.states),
        types: list(&cli.types),
        integrations: list(&cli.integrations),
        live,
        demo: cli.demo.then_some(true),
        serve: cli.serve.then_some(true),
        ..PartialConfig::default()
    }
}

fn env_overrides(env: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    if let Some(url) = env.get("OPSTAIL_URL") {
        partial.url = Some(url.clone());
    }
    if let Some(value) = env.get("OPSTAIL_ENV") {
        partial.env = Some(value.clone());
    }
    if let Some(value) = env.get("OPSTAIL_AUTH_TOKEN").or_else(|| env.get("OPSTAIL_TOKEN")) {
        if !value.trim().is_empty() {
            partial.auth_token = Some(value.clone());
        }
    }
    if let Some(host) = env.get("OPSTAIL_HOST") {
        partial.host = Some(host.clone());
    }
    if let Some(port) = env.get("OPSTAIL_PORT") {
        partial.port = Some(parse_u16("OPSTAIL_PORT", port)?);
    }
    if let Some(value) = env.get("OPSTAIL_ALLOW_REMOTE") {
        partial.allow_remote = Some(parse_bool("OPSTAIL_ALLOW_REMOTE", value)?);
    }
    if let Some(value) = env.get("OPSTAIL_PAGE_LIMIT") {
        partial.page_limit = Some(parse_usize("OPSTAIL_PAGE_LIMIT", value)?);
    }
    if let Some(value) = env.get("OPSTAIL_POLL_INTERVAL_MS") {
        partial.poll_interval_ms = Some(parse_u64("OPSTAIL_POLL_INTERVAL_MS", value)?);
    }
    if let Some(value) = env.get("OPSTAIL_NEAR_BOTTOM_PX") {
        partial.near_bottom_px = Some(parse_f64("OPSTAIL_NEAR_BOTTOM_PX", value)?);
    }
    if let Some(value) = env.get("OPSTAIL_CURSOR_MAX_AGE_MS") {
        partial.cursor_max_age_ms = Some(parse_u64("OPSTAIL_CURSOR_MAX_AGE_MS", value)?);
    }
    if let Some(value) = env.get("OPSTAIL_STREAM") {
        partial.stream = Some(value.clone());
    }
    if let Some(value) = env.get("OPSTAIL_OPERATION_ID") {
        partial.operation_id = Some(value.clone());
    }
    if let Some(value) = env.get("OPSTAIL_SEARCH") {
        partial.search = Some(value.clone());
    }
    if let Some(value) = env.get("OPSTAIL_WINDOW") {
        if PeriodPreset::parse(value).is_none() {
            return Err(ConfigError::InvalidEnv { name: "OPSTAIL_WINDOW".to_string(), value: value.clone() });
        }
        partial.window = Some(value.clone());
    }
    if let Some(value) = env.get("OPSTAIL_STATES") {
        partial.states = Some(parse_list(value));
    }
    if let Some(value) = env.get("OPSTAIL_TYPES") {
        partial.types = Some(parse_list(value));
    }
    if let Some(value) = env.get("OPSTAIL_INTEGRATIONS") {
        partial.integrations = Some(parse_list(value));
    }
    if let Some(value) = env.get("OPSTAIL_NO_LIVE") {
        let disabled = parse_bool("OPSTAIL_NO_LIVE", value)?;
        partial.live = Some(!disabled);
    }
    if partial.live.is_none() {
        if let Some(value) = env.get("OPSTAIL_LIVE") {
            partial.live = Some(parse_bool("OPSTAIL_LIVE", value)?);
        }
    }
    if let Some(value) = env.get("OPSTAIL_DEMO") {
        partial.demo = Some(parse_bool("OPSTAIL_DEMO", value)?);
    }
    if let Some(value) = env.get("OPSTAIL_SERVE") {
        partial.serve = Some(parse_bool("OPSTAIL_SERVE", value)?);
    }
    Ok(partial)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_u16(name: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_f64(name: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite() && *parsed >= 0.0)
        .ok_or_else(|| ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() }),
    }
}

fn load_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let parsed: FileConfig = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;
    Ok(parsed.into_partial())
}

fn find_config_path(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

fn resolve_config(
    cli: &Cli,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let mut partial = PartialConfig::default();

    let config_path = if let Some(path) = &cli.config {
        if !path.is_file() {
            return Err(ConfigError::MissingConfig { path: path.clone() });
        }
        Some(path.clone())
    } else {
        find_config_path(cwd)
    };

    if let Some(path) = config_path.as_ref() {
        let file_partial = load_config_file(path)?;
        partial.merge(file_partial);
    }

    let env_partial = env_overrides(env)?;
    partial.merge(env_partial);

    let cli_partial = cli_overrides(cli);
    partial.merge(cli_partial);

    Ok((Config::from_partial(partial), config_path))
}

fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr, std::io::Error> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no bind addresses resolved")
    })
}

async fn run_server(
    config: Config,
    backend: Arc<MemoryBackend>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), DynError> {
    let addr = resolve_bind_addr(&config.host, config.port)?;
    if !config.allow_remote && !addr.ip().is_loopback() {
        return Err(format!(
            "refusing to bind to non-loopback address {addr}. Set OPSTAIL_ALLOW_REMOTE=1 if you really want remote access."
        )
        .into());
    }
    let app = router(backend, config.auth_token.clone());
    info!(%addr, "starting http server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

/// Tracks which entries of a stream have already been printed. Ids are kept
/// across snapshots, so entries that leave the cache and come back are not
/// printed twice; the oldest ids are forgotten past `capacity`.
#[derive(Debug)]
struct TailPrinter {
    generation: Option<u64>,
    printed: HashSet<String>,
    printed_order: VecDeque<String>,
    capacity: usize,
    last_error: Option<FetchError>,
}

impl Default for TailPrinter {
    fn default() -> Self {
        Self::with_capacity(PRINTED_ID_CAPACITY)
    }
}

impl TailPrinter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            generation: None,
            printed: HashSet::new(),
            printed_order: VecDeque::new(),
            capacity: capacity.max(1),
            last_error: None,
        }
    }

    /// Entries not printed before, oldest first.
    fn surfaced<'a>(&mut self, snapshot: &'a StreamSnapshot) -> Vec<&'a LogEntry> {
        if self.generation != Some(snapshot.generation) {
            self.generation = Some(snapshot.generation);
            self.printed.clear();
            self.printed_order.clear();
        }
        let mut fresh: Vec<&LogEntry> =
            snapshot.entries.iter().filter(|entry| !self.printed.contains(&entry.id)).collect();
        fresh.reverse();
        for entry in &fresh {
            self.remember(&entry.id);
        }
        fresh
    }

    fn remember(&mut self, id: &str) {
        if !self.printed.insert(id.to_string()) {
            return;
        }
        self.printed_order.push_back(id.to_string());
        while self.printed_order.len() > self.capacity {
            if let Some(forgotten) = self.printed_order.pop_front() {
                self.printed.remove(&forgotten);
            }
        }
    }

    fn print(&mut self, snapshot: &StreamSnapshot, out: &mut impl Write) -> io::Result<()> {
        if snapshot.error != self.last_error {
            if let Some(error) = &snapshot.error {
                warn!(kind = error.kind(), %error, "fetch failed");
            }
            self.last_error = snapshot.error.clone();
        }
        for entry in self.surfaced(snapshot) {
            writeln!(out, "{}", format_line(entry))?;
        }
        out.flush()
    }
}

fn format_line(entry: &LogEntry) -> String {
    let scope = match (&entry.integration, &entry.sync) {
        (Some(integration), Some(sync)) => format!("{integration}/{sync}"),
        (Some(integration), None) => integration.clone(),
        (None, _) => entry.operation_id.clone().unwrap_or_else(|| "-".to_string()),
    };
    let mut message: String = entry.message.chars().take(MESSAGE_PREVIEW).collect();
    if entry.message.chars().count() > MESSAGE_PREVIEW {
        message.push('…');
    }
    let duration = entry.duration_ms.map(|ms| format!(" ({ms}ms)")).unwrap_or_default();
    format!(
        "{} {:<9} {:<8} {:<24} {}{}",
        entry.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.status_label(),
        entry.r#type,
        scope,
        message,
        duration
    )
}

async fn run_tail<S: LogSource + ?Sized>(
    source: Arc<S>,
    stream: LogStream,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), DynError> {
    let handle = StreamDriver::spawn(source, stream);
    let mut snapshots = handle.snapshots();
    let mut printer = TailPrinter::default();

    loop {
        tokio::select! {
            res = shutdown.recv() => {
                match res {
                    Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                printer.print(&snapshot, &mut io::stdout().lock())?;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

pub async fn run() -> Result<(), DynError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();
    let (config, config_path) = resolve_config(&cli, &cwd, &env_map)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config file");
    }

    info!(
        url = ?config.url,
        env = ?config.env,
        host = %config.host,
        port = config.port,
        page_limit = config.page_limit,
        poll_interval_ms = config.poll_interval_ms,
        cursor_max_age_ms = config.cursor_max_age_ms,
        stream = %config.stream,
        window = %config.window,
        live = config.live,
        demo = config.demo,
        serve = config.serve,
        auth_enabled = config.auth_token.is_some(),
        "resolved config"
    );

    let (shutdown_tx, _) = broadcast::channel(4);

    let backend = Arc::new(MemoryBackend::new());
    let demo_handle = if config.demo {
        let mut generator = DemoGenerator::new(demo_seed());
        seed_backend(&backend, &mut generator, DEFAULT_DEMO_HISTORY)?;
        info!(entries = backend.len(), "demo mode enabled (generating local operations)");
        Some(tokio::spawn(run_demo(backend.clone(), generator, shutdown_tx.subscribe())))
    } else {
        None
    };

    let mut task = if config.serve {
        tokio::spawn(run_server(config.clone(), backend.clone(), shutdown_tx.subscribe()))
    } else {
        let filters = config.filters()?;
        let stream = LogStream::new(filters, config.live, config.stream_config());
        if let Some(url) = &config.url {
            let source = HttpLogSource::new(url.clone())?
                .with_env(config.env.clone())
                .with_auth_token(config.auth_token.clone());
            info!(url = %url, "tailing remote backend");
            tokio::spawn(run_tail(Arc::new(source), stream, shutdown_tx.subscribe()))
        } else if config.demo {
            tokio::spawn(run_tail(backend.clone(), stream, shutdown_tx.subscribe()))
        } else {
            return Err("nothing to tail: pass --url, --demo or --serve".into());
        }
    };

    let mut task_result: Option<Result<(), DynError>> = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let _ = shutdown_tx.send(());
        }
        res = &mut task => {
            task_result = Some(res?);
            let _ = shutdown_tx.send(());
        }
    }

    let _ = shutdown_tx.send(());

    let task_result = match task_result {
        Some(result) => result,
        None => task.await?,
    };
    if let Some(handle) = demo_handle {
        let _ = handle.await;
    }
    task_result
}
