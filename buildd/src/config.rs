use std::path::PathBuf;

use engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP API listens on
    pub port: u16,
    /// TOML file with the engine settings and the project list
    pub config_path: PathBuf,
    /// Engine settings after environment overrides
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let port = env_parse("BUILDD_PORT", 3000)?;
        let config_path = PathBuf::from(env_str("BUILDD_CONFIG", "buildd.toml"));
        let mut engine = EngineConfig::load(&config_path)?;

        if let Some(path) = env_opt("BUILDD_DATABASE_PATH") {
            engine.database_path = PathBuf::from(path);
        }
        if let Some(path) = env_opt("BUILDD_LOGS_DIR") {
            engine.logs_dir = PathBuf::from(path);
        }
        if env_opt("BUILDD_MAX_PARALLEL_BUILDS").is_some() {
            engine.max_parallel_builds =
                env_parse("BUILDD_MAX_PARALLEL_BUILDS", engine.max_parallel_builds)?;
        }

        Ok(Self {
            port,
            config_path,
            engine,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
