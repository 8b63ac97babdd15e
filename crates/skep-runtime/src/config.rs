//! Node and service configuration models.
//!
//! A node config file is a JSON array of per-node objects; the binary picks
//! its own entry by `sid`. Service configs carry a fixed set of recognized
//! keys, everything else is opaque and forwarded to the service untouched.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configuration for one service, passed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Entry module of the service; resolved against the registered service
    /// types (extension, if any, is ignored).
    pub file: String,
    #[serde(default)]
    pub unique: bool,
    /// Heap limit in bytes; zero means unlimited.
    #[serde(default)]
    pub memlimit: u64,
    /// Appended module search path.
    #[serde(default)]
    pub path: Option<String>,
    /// Appended native module search path.
    #[serde(default)]
    pub cpath: Option<String>,
    /// Unrecognized keys, forwarded to the service as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            unique: false,
            memlimit: 0,
            path: None,
            cpath: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// The service type this config resolves to: the `file` value with any
    /// extension stripped.
    pub fn service_type(&self) -> &str {
        Path::new(&self.file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(serde_json::Value::as_u64)
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

/// Per-node server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub sid: u16,
    pub name: String,
    #[serde(default = "default_threads")]
    pub thread: usize,
    /// Log path template; `#sid` and `#date` are substituted.
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl NodeConfig {
    pub fn new(sid: u16, name: impl Into<String>, thread: usize) -> Self {
        Self {
            sid,
            name: name.into(),
            thread,
            log: None,
            services: Vec::new(),
        }
    }

    /// Parse a JSON array of node configs and select the entry for `sid`.
    pub fn load(json: &str, sid: u16) -> Result<NodeConfig, Error> {
        let nodes: Vec<NodeConfig> =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        nodes
            .into_iter()
            .find(|n| n.sid == sid)
            .ok_or_else(|| Error::Config(format!("no node with sid {sid}")))
    }

    /// Expand `#sid` and `#date` placeholders in the log path template.
    pub fn log_path(&self, date: &str) -> Option<String> {
        self.log
            .as_ref()
            .map(|t| t.replace("#sid", &self.sid.to_string()).replace("#date", date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_keys_are_preserved() {
        let json = r#"{"name":"gate","file":"gate.lua","unique":true,"host":"0.0.0.0","port":8889}"#;
        let conf: ServiceConfig = serde_json::from_str(json).unwrap();

        assert_eq!(conf.name, "gate");
        assert_eq!(conf.service_type(), "gate");
        assert!(conf.unique);
        assert_eq!(conf.memlimit, 0);
        assert_eq!(conf.extra_str("host"), Some("0.0.0.0"));
        assert_eq!(conf.extra_u64("port"), Some(8889));
    }

    #[test]
    fn node_selection_by_sid() {
        let json = r#"[
            {"sid": 1, "name": "alpha", "thread": 2, "services": []},
            {"sid": 2, "name": "beta", "log": "logs/#sid-#date.log", "services": []}
        ]"#;

        let node = NodeConfig::load(json, 2).unwrap();
        assert_eq!(node.name, "beta");
        assert_eq!(node.log_path("20260801").unwrap(), "logs/2-20260801.log");

        assert!(NodeConfig::load(json, 9).is_err());
    }

    #[test]
    fn thread_count_defaults_to_parallelism() {
        let json = r#"[{"sid": 1, "name": "solo", "services": []}]"#;
        let node = NodeConfig::load(json, 1).unwrap();
        assert!(node.thread >= 1);
    }
}
