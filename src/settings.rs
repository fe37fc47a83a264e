use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::cli::{Cli, LogFormat};
use crate::proxy::headers::HeaderRule;
use crate::proxy::origin::Origin;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8090))
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_read_only() -> bool {
    true
}

fn default_workers() -> usize {
    256
}

fn default_copy_chunk_size() -> usize {
    1024
}

fn default_client_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> u64 {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Serve local files and fetch misses from the origin.
    #[default]
    Proxy,
    /// Serve local files only.
    Share,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_copy_chunk_size")]
    pub copy_chunk_size: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: u64,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub mime_map: Option<PathBuf>,
    #[serde(default)]
    pub header_rules: HashMap<String, HeaderRule>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = config_path.as_ref() {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("WEBSHARE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = config_path.as_ref() {
            settings.apply_base_dir(path);
        }
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults with `root` set; the starting point for embedding the server.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            listen: default_listen(),
            root: root.into(),
            mode: Mode::default(),
            origin: None,
            read_only: default_read_only(),
            workers: default_workers(),
            copy_chunk_size: default_copy_chunk_size(),
            client_timeout: default_client_timeout(),
            max_header_size: default_max_header_size(),
            max_request_body_size: default_max_request_body_size(),
            auth: None,
            mime_map: None,
            header_rules: HashMap::new(),
            log: default_log_format(),
            metrics_listen: None,
        }
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    /// Command-line flags win over the file and the environment.
    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(root) = cli.root.clone() {
            self.root = root;
        }
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if let Some(origin) = cli.origin.clone() {
            self.origin = Some(origin);
        }
        if cli.writable {
            self.read_only = false;
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if let Some(auth) = cli.auth.clone() {
            self.auth = Some(auth);
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.root = absolutize(&self.root, base_dir);
        self.mime_map = self.mime_map.as_ref().map(|path| absolutize(path, base_dir));
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.workers > 0,
            "workers must be at least 1 (got {})",
            self.workers
        );
        ensure!(
            self.copy_chunk_size > 0,
            "copy_chunk_size must be greater than 0 (got {})",
            self.copy_chunk_size
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        if let Some(auth) = self.auth.as_deref() {
            ensure!(
                auth.contains(':'),
                "auth must be given as user:password"
            );
        }
        if let Some(origin) = self.origin.as_deref() {
            Origin::parse(origin).context("invalid origin")?;
            ensure!(
                self.mode == Mode::Proxy,
                "origin is only used in proxy mode"
            );
        }
        if self.mode == Mode::Share {
            ensure!(
                self.header_rules.is_empty(),
                "header_rules are only used in proxy mode"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config.as_ref() {
        return Some(path.clone());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("webshare.toml"),
        PathBuf::from("/etc/webshare/webshare.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
