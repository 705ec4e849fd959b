// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! TOML configuration, loaded once per process.
//!
//! Lookup order: `$NOVAFLOW_CONFIG`, then `./novaflow.toml`. Every key is
//! optional; see [`NovaFlowConfig`] and [`RuntimeConfig`] for defaults.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

const CONFIG_ENV: &str = "NOVAFLOW_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "novaflow.toml";

static CONFIG: OnceLock<NovaFlowConfig> = OnceLock::new();

/// Loads `path` unless a config is already installed, in which case the
/// installed one is returned and `path` is not read.
pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaFlowConfig> {
    if let Some(installed) = CONFIG.get() {
        return Ok(installed);
    }
    let loaded = NovaFlowConfig::load_from_file(path.as_ref())?;
    Ok(CONFIG.get_or_init(|| loaded))
}

pub fn init_from_env_or_default() -> Result<&'static NovaFlowConfig> {
    match CONFIG.get() {
        Some(installed) => Ok(installed),
        None => init_from_path(locate_config_file()?),
    }
}

pub fn config() -> Result<&'static NovaFlowConfig> {
    init_from_env_or_default()
}

fn locate_config_file() -> Result<PathBuf> {
    let from_env = std::env::var(CONFIG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    if let Some(path) = from_env {
        return Ok(path);
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if !local.exists() {
        bail!(
            "no config file: set ${} or create ./{}",
            CONFIG_ENV,
            DEFAULT_CONFIG_FILE
        );
    }
    Ok(local)
}

fn default_log_level() -> String {
    String::from("info")
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaFlowConfig {
    /// Level name used when `log_filter` is absent.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `EnvFilter` directive such as `novaflow::exec=debug`; wins over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl NovaFlowConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read novaflow config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid novaflow config {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: NovaFlowConfig = toml::from_str(s)?;
        cfg.runtime.validate()?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.log_level.clone())
    }
}

impl Default for NovaFlowConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Pool size for parallel execution, 0 means available parallelism.
    #[serde(default)]
    pub exec_threads: usize,
    #[serde(default = "default_use_threads")]
    pub use_threads: bool,
    #[serde(default = "default_sink_pause_if_above_bytes")]
    pub sink_pause_if_above_bytes: u64,
    #[serde(default = "default_sink_resume_if_below_bytes")]
    pub sink_resume_if_below_bytes: u64,
}

fn default_use_threads() -> bool {
    true
}

fn default_sink_pause_if_above_bytes() -> u64 {
    1 << 30
}

fn default_sink_resume_if_below_bytes() -> u64 {
    1 << 28
}

impl RuntimeConfig {
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            return self.exec_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn validate(&self) -> Result<()> {
        if self.sink_pause_if_above_bytes > 0
            && self.sink_resume_if_below_bytes >= self.sink_pause_if_above_bytes
        {
            bail!(
                "runtime.sink_resume_if_below_bytes ({}) must be less than runtime.sink_pause_if_above_bytes ({})",
                self.sink_resume_if_below_bytes,
                self.sink_pause_if_above_bytes
            );
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_threads: 0,
            use_threads: default_use_threads(),
            sink_pause_if_above_bytes: default_sink_pause_if_above_bytes(),
            sink_resume_if_below_bytes: default_sink_resume_if_below_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = NovaFlowConfig::parse("").expect("parse empty config");
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.runtime.use_threads);
        assert_eq!(cfg.runtime.sink_pause_if_above_bytes, 1 << 30);
        assert_eq!(cfg.runtime.sink_resume_if_below_bytes, 1 << 28);
        assert!(cfg.runtime.actual_exec_threads() >= 1);
    }

    #[test]
    fn log_filter_takes_precedence_over_level() {
        let cfg = NovaFlowConfig::parse(
            r#"
log_level = "warn"
log_filter = "novaflow=debug"
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.effective_log_filter(), "novaflow=debug");

        let cfg = NovaFlowConfig::parse("log_level = \"warn\"").expect("parse config");
        assert_eq!(cfg.effective_log_filter(), "warn");
    }

    #[test]
    fn rejects_inverted_backpressure_thresholds() {
        let err = NovaFlowConfig::parse(
            r#"
[runtime]
sink_pause_if_above_bytes = 100
sink_resume_if_below_bytes = 100
"#,
        )
        .expect_err("thresholds must be ordered");
        assert!(err.to_string().contains("sink_resume_if_below_bytes"));
    }
}
