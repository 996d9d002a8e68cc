use std::{net::SocketAddr, path::PathBuf, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::warn;

use crate::error::Error;

/// Limits and timeouts of the engine.
///
/// Every field has a default, so a config file only needs the values that
/// differ from it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Accept inbound peer connections on this address.
    pub listen_addr: Option<SocketAddr>,

    /// How many torrents the supervisor accepts at the same time.
    pub max_torrents: usize,

    /// Target number of live connections of each torrent.
    pub max_peers: usize,

    /// Block requests kept in flight on each connection.
    pub pipeline_depth: usize,

    /// Requests of a remote peer we queue before ignoring new ones.
    pub max_incoming_requests: usize,

    /// Endgame starts when fewer than this many pieces are missing.
    pub endgame_threshold: usize,

    /// Corrupted pieces a peer may send before it is dropped and banned.
    pub strike_threshold: u32,

    pub connect_timeout_ms: u64,

    /// If nothing arrives for this long a keep-alive is sent, and if nothing
    /// arrives for twice as long the connection is closed.
    pub keep_alive_ms: u64,

    /// Requests that are not answered within this time go back to the
    /// PieceManager.
    pub request_timeout_ms: u64,

    /// First delay before reconnecting to a peer that failed, doubled on
    /// each attempt.
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_torrents: 16,
            max_peers: 50,
            pipeline_depth: 5,
            max_incoming_requests: 250,
            endgame_threshold: 4,
            strike_threshold: 3,
            connect_timeout_ms: 10_000,
            keep_alive_ms: 120_000,
            request_timeout_ms: 30_000,
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 300_000,
            reconnect_attempts: 5,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let non_zero = [
            ("max_torrents", self.max_torrents as u64),
            ("max_peers", self.max_peers as u64),
            ("pipeline_depth", self.pipeline_depth as u64),
            ("strike_threshold", self.strike_threshold as u64),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("keep_alive_ms", self.keep_alive_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, v) in non_zero {
            if v == 0 {
                return Err(Error::ConfigError(format!(
                    "`{name}` must be greater than zero"
                )));
            }
        }
        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(Error::ConfigError(
                "`reconnect_base_ms` is larger than `reconnect_max_ms`".into(),
            ));
        }
        Ok(())
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config = toml::from_str::<Config>(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the configuration file, creating its folder if needed.
    pub async fn config_path() -> Result<PathBuf, Error> {
        // errors if the user does not have a home folder
        let dotfile =
            ProjectDirs::from("", "", "Sciame").ok_or(Error::HomeInvalid)?;
        let config_dir = dotfile.config_dir().to_path_buf();

        if !config_dir.exists() {
            create_dir_all(&config_dir).await.map_err(|_| {
                Error::FolderOpenError(config_dir.display().to_string())
            })?;
        }

        Ok(config_dir.join("config.toml"))
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist or can't be parsed, it is replaced
    /// with the default configuration.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_path().await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match Self::from_toml(&dst) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("invalid config at {path:?}, writing defaults: {e}");

                let config = Config::default();
                let config_str = toml::to_string(&config)?;

                let mut file = OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await?;
                file.write_all(config_str.as_bytes()).await?;

                Ok(config)
            }
        }
    }
}
