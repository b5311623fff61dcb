use std::env;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use streaming::EngineConfig;
use streaming::protocol::DEFAULT_SCHEME;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub query_engine_url: String,
    pub scheme: String,
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Engine settings from `TILE_ENGINE_CONFIG` (JSON) if set, then env
    /// overrides.
    pub fn from_env() -> Result<Self> {
        let engine = match env::var("TILE_ENGINE_CONFIG") {
            Ok(path) => load_engine_config(Path::new(&path))?,
            Err(_) => EngineConfig::default(),
        };
        let mut config = Self::with_engine(engine)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.engine.validate().context("invalid engine config")?;
        Ok(config)
    }

    fn with_engine(engine: EngineConfig) -> Result<Self> {
        Ok(Self {
            addr: "127.0.0.1:9200".parse()?,
            query_engine_url: "http://127.0.0.1:9300/sql".to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            engine,
        })
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(addr) = var("TILE_SERVER_ADDR") {
            self.addr = addr
                .parse()
                .with_context(|| format!("invalid TILE_SERVER_ADDR {addr:?}"))?;
        }
        if let Some(url) = var("QUERY_ENGINE_URL") {
            self.query_engine_url = url;
        }
        if let Some(scheme) = var("TILE_SCHEME") {
            self.scheme = scheme;
        }
        let cache = &mut self.engine.cache;
        cache.capacity = env_var_usize(&var, "TILE_CACHE_CAPACITY", cache.capacity);
        let scheduler = &mut self.engine.scheduler;
        scheduler.worker_slots = env_var_usize(&var, "TILE_WORKER_SLOTS", scheduler.worker_slots);
        Ok(())
    }
}

fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading engine config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing engine config {}", path.display()))
}

fn env_var_usize(var: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
