use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::settings::Mode;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "webshare",
    about = "Personal file share with a write-through caching reverse proxy"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to ./webshare.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8090.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Directory files are served from and cached into.
    #[arg(long)]
    pub root: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Origin base URL fetched on a cache miss.
    #[arg(long)]
    pub origin: Option<String>,

    /// Persist cacheable origin responses under the root.
    #[arg(long)]
    pub writable: bool,

    /// Maximum number of requests served concurrently.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Basic auth credentials as `user:password`.
    #[arg(long)]
    pub auth: Option<String>,

    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
