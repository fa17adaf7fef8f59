use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables of the download engine. `new` fills in the defaults, tests
/// shorten the intervals by overwriting the fields.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection string of the cuttlestore holding downloads, activity and
    /// settings.
    pub store_path: String,
    /// Used until a download directory has been saved in the store.
    pub download_directory: PathBuf,
    pub progress_interval: Duration,
    pub checkpoint_interval: Duration,
    /// A download with no progress for this long is checked by the stall sweep.
    pub stall_threshold: Duration,
    pub stall_sweep_interval: Duration,
    /// Activity entries kept before the oldest are dropped.
    pub activity_retention: usize,
}

impl EngineConfig {
    pub fn new(store_path: impl Into<String>, download_directory: impl Into<PathBuf>) -> Self {
        EngineConfig {
            store_path: store_path.into(),
            download_directory: download_directory.into(),
            progress_interval: Duration::from_millis(250),
            checkpoint_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(30),
            stall_sweep_interval: Duration::from_secs(5),
            activity_retention: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Password for basic auth, the server refuses to start without one.
    pub password: Option<String>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let store_path = env::var("STORE_PATH")
            .unwrap_or_else(|_| "sqlite:///data/drogue-dm.sqlite".to_string());
        let download_directory =
            env::var("DOWNLOAD_DIR").unwrap_or_else(|_| "/data/downloads".to_string());
        ServerConfig {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            password: env::var("DROGUE_DM_PASSWORD").ok().filter(|p| !p.is_empty()),
            engine: EngineConfig::new(store_path, download_directory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::new("sqlite:///tmp/a.sqlite", "/tmp/downloads");
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.checkpoint_interval, Duration::from_secs(1));
        assert_eq!(config.stall_threshold, Duration::from_secs(30));
        assert_eq!(config.activity_retention, 1000);
        assert_eq!(config.download_directory, PathBuf::from("/tmp/downloads"));
    }
}
