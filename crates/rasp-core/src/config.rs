use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::RaspError;
use crate::ids::AgentId;
use crate::types::AgentMetadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub pool: PoolConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub stack: StackConfig,
    pub policy: PolicyConfig,
    pub reporting: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub app_id: String,
    /// Generated once per process when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub check_timeout_ms: u64,
    pub coalesce_misses: bool,
    pub emit_allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub max_depth: usize,
    pub start_offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub enabled: bool,
    pub event_log: String,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn default_config() -> Self {
        Self {
            agent: AgentConfig {
                app_id: "default".to_string(),
                agent_id: None,
                host_name: None,
            },
            pool: PoolConfig {
                min_size: 2,
                max_size: 8,
                acquire_timeout_ms: 500,
                idle_timeout_ms: 60_000,
            },
            engine: EngineConfig {
                check_timeout_ms: 2_000,
                coalesce_misses: false,
                emit_allowed: false,
            },
            cache: CacheConfig { capacity: 1024 },
            stack: StackConfig {
                max_depth: 100,
                start_offset: 0,
            },
            policy: PolicyConfig {
                path: "${CONFIG_DIR}/policy.toml".to_string(),
            },
            reporting: ReportConfig {
                enabled: true,
                event_log: "${DATA_DIR}/events.jsonl".to_string(),
                queue_capacity: 1024,
            },
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let output = toml::to_string_pretty(self).context("render config TOML")?;
        Ok(output)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read config at {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let contents = self.to_toml_string()?;
        fs::write(path, contents).with_context(|| format!("write config at {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RaspError> {
        if self.pool.max_size == 0 {
            return Err(RaspError::InvalidConfig(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(RaspError::InvalidConfig(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(RaspError::InvalidConfig(
                "pool.acquire_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.engine.check_timeout_ms == 0 {
            return Err(RaspError::InvalidConfig(
                "engine.check_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.reporting.enabled && self.reporting.queue_capacity == 0 {
            return Err(RaspError::InvalidConfig(
                "reporting.queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves agent identity, generating an agent id when none is configured.
    pub fn agent_metadata(&self) -> AgentMetadata {
        let host_name = self
            .agent
            .host_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| {
                fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|name| name.trim().to_string())
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        AgentMetadata {
            host_name,
            agent_id: self.agent.agent_id.unwrap_or_default(),
            app_id: self.agent.app_id.clone(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl EngineConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

impl ConfigPaths {
    pub fn resolve() -> Result<Self> {
        let project_dirs = ProjectDirs::from("io", "rasp", "rasp")
            .ok_or_else(|| anyhow::anyhow!("unable to determine project directories"))?;
        let config_dir = project_dirs.config_dir();
        let data_dir = project_dirs.data_dir();
        Ok(Self {
            config_path: config_dir.join("config.toml"),
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Paths rooted at an explicit config file, used when `--config` is given.
    pub fn for_config_file(config_path: &Path) -> Result<Self> {
        let resolved = Self::resolve()?;
        Ok(Self {
            config_path: config_path.to_path_buf(),
            data_dir: resolved.data_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or(&self.data_dir)
    }
}
