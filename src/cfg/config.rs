// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{CodecConfig, HeadDialectConfig};
use crate::cfg::ini;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Wire-level settings shared by every transport this process binds.
    pub rpc: RpcSettings,
    /// Implementation-only knobs that never travel over the wire.
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcSettings {
    /// Body codec negotiated for every connection this process serves.
    pub codec: CodecConfig,
    /// Message-head dialect framing name/type/session id around the body.
    #[serde(rename = "HeadDialect")]
    pub head_dialect: HeadDialectConfig,
    /// Addresses to bind at startup, `<scheme>://<host>:<port>` per
    /// [`crate::url::ServiceUrl`].
    pub listen: Vec<String>,
    /// Default `send_sync`/`send_parallel` deadline when a caller
    /// doesn't pick one explicitly.
    #[serde(rename = "DefaultTimeoutMs")]
    pub default_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Retained for interface fidelity with the original's ucontext
    /// stack pool; see [`crate::scheduler::SchedulerConfig`].
    #[serde(rename = "StackSizeKb")]
    pub stack_size_kb: usize,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Loads the configuration from the flat `[section]` / `key = value`
    /// grammar the original Pebble framework reads via `inih`, for
    /// deployments that ship an existing `.conf` rather than YAML.
    pub fn load_from_ini<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let kv = ini::parse(&s).context("failed to parse config INI")?;
        let mut cfg = Self::from_ini_map(&kv)?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    fn from_ini_map(kv: &std::collections::HashMap<(String, String), String>) -> Result<Self> {
        let get = |section: &str, key: &str| -> Result<&str> {
            kv.get(&(section.to_string(), key.to_string()))
                .map(String::as_str)
                .with_context(|| format!("missing [{section}] {key}"))
        };

        let codec = match get("rpc", "codec")? {
            "binary" => CodecConfig::Binary,
            "json" => CodecConfig::Json,
            "bson" => CodecConfig::Bson,
            other => anyhow::bail!("unknown codec {other:?}"),
        };
        let head_dialect = match get("rpc", "head_dialect")? {
            "thrift" => HeadDialectConfig::Thrift,
            "protobuf" => HeadDialectConfig::Protobuf,
            other => anyhow::bail!("unknown head_dialect {other:?}"),
        };
        let listen = get("rpc", "listen")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let default_timeout_ms = get("rpc", "default_timeout_ms")?
            .parse()
            .context("rpc.default_timeout_ms must be an integer")?;
        let stack_size_kb = get("runtime", "stack_size_kb")?
            .parse()
            .context("runtime.stack_size_kb must be an integer")?;

        Ok(Config {
            rpc: RpcSettings { codec, head_dialect, listen, default_timeout_ms },
            runtime: RuntimeConfig { stack_size_kb },
        })
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.rpc.listen.is_empty(), "rpc.listen must name at least one address");
        ensure!(self.rpc.default_timeout_ms > 0, "rpc.default_timeout_ms must be > 0");
        ensure!(self.runtime.stack_size_kb > 0, "runtime.stack_size_kb must be > 0");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_config_with_no_listen_addresses() {
        let mut cfg = Config {
            rpc: RpcSettings {
                codec: CodecConfig::Binary,
                head_dialect: HeadDialectConfig::Thrift,
                listen: vec![],
                default_timeout_ms: 5_000,
            },
            runtime: RuntimeConfig { stack_size_kb: 256 },
        };
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn loads_an_ini_file_into_the_same_shape_as_yaml() {
        let ini_text = "[rpc]\ncodec = json\nhead_dialect = thrift\nlisten = tcp://127.0.0.1:7500\ndefault_timeout_ms = 3000\n\n[runtime]\nstack_size_kb = 128\n";
        let dir = std::env::temp_dir().join(format!("pebble-cfg-test-{:?}", std::thread::current().id()));
        fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("pebble.conf");
        fs::write(&path, ini_text).expect("write ini");

        let cfg = Config::load_from_ini(&path).expect("load ini");
        assert_eq!(cfg.rpc.codec, CodecConfig::Json);
        assert_eq!(cfg.rpc.listen, vec!["tcp://127.0.0.1:7500".to_string()]);
        assert_eq!(cfg.rpc.default_timeout_ms, 3_000);
        assert_eq!(cfg.runtime.stack_size_kb, 128);

        fs::remove_dir_all(&dir).ok();
    }
}
