use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use directories_next::ProjectDirs;
use serde::Deserialize;

/// Prefix for environment overrides, e.g. `VANISHBIN_STORAGE__KIND=file`.
const ENV_PREFIX: &str = "VANISHBIN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_address: IpAddr,
    pub port: u16,
    pub base_url: Option<String>,
    /// Honour the `x-test-now-ms` request header. Never enable in production.
    pub test_mode: bool,
    pub storage: Storage,
    pub limits: Limits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    pub kind: Option<StorageKind>,
    pub ttl_grace_secs: u64,
    pub file: Option<FileStorage>,
    pub upstash: Option<UpstashStorage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileStorage {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstashStorage {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    File,
    #[cfg(feature = "upstash")]
    Upstash,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    pub max_upload_size: usize,
}

impl Config {
    /// Load the config from defaults, a TOML file and the environment, in
    /// increasing order of precedence.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::from(default_path()).required(false),
        };
        Self::from_source(file)
    }

    fn from_source<S>(source: S) -> anyhow::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        builder()?
            .add_source(source)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("failed to read config")?
            .try_deserialize()
            .context("failed to deserialize config")
    }
}

fn builder() -> anyhow::Result<config::ConfigBuilder<config::builder::DefaultState>> {
    Ok(config::Config::builder()
        .set_default("listen_address", "127.0.0.1")?
        .set_default("port", 3001)?
        .set_default("test_mode", false)?
        .set_default("storage.ttl_grace_secs", 60)?
        .set_default("limits.max_upload_size", 1024 * 1024)?)
}

/// `config.toml` in the working directory if there is one, otherwise in the
/// platform config directory.
fn default_path() -> PathBuf {
    let local = PathBuf::from("config.toml");
    if local.exists() {
        return local;
    }
    ProjectDirs::from("", "", "vanishbin")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or(local)
}
