use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::stack::DEFAULT_WORKER_THREADS;

/// Contents of `datastack.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Stack name; the store file is named after it
    pub name: String,
    pub database: Option<PathBuf>,
    pub model: Option<PathBuf>,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

impl StackConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
            model: None,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }

    /// Store file, relative paths resolved against `base`
    pub fn database_path(&self, base: &Path) -> PathBuf {
        match &self.database {
            Some(path) => base.join(path),
            None => default_database_path_in(base, &self.name),
        }
    }

    /// Model file, relative paths resolved against `base`
    pub fn model_path(&self, base: &Path) -> PathBuf {
        match &self.model {
            Some(path) => base.join(path),
            None => default_model_path_in(base, &self.name),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("datastack.toml")
}

pub fn default_database_path_in(base: &Path, name: &str) -> PathBuf {
    base.join(".datastack").join(format!("{}.sqlite", name))
}

pub fn default_model_path_in(base: &Path, name: &str) -> PathBuf {
    base.join(format!("{}.model.toml", name))
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<StackConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: StackConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &StackConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
