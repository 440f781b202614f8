use serde::{Deserialize, Serialize};

/// Default upper bound for a single RPC frame (100 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Name used in logs. Envelopes always name `gateway` as sender and
    /// first hop, whatever this is set to.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Maximum size in bytes of one frame, enforced on read and write.
    pub max_message_size: usize,
    /// Accept spawn calls from remote clients. Remote code execution surface.
    pub allow_spawn: bool,
    /// Keep inherited `http_proxy`/`https_proxy` variables.
    pub proxy: bool,
    /// Delay between consecutive sends of one bridging call, in milliseconds.
    pub sleep_ms: u64,
    /// Fabric identity; a random one is generated when left empty.
    pub identity: String,
    pub fabric: FabricConfig,
    pub worker: WorkerConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program launched for every spawned pea.
    pub program: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "gateway".to_string(),
            host: "0.0.0.0".to_string(),
            port: 55555,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            allow_spawn: false,
            proxy: false,
            sleep_ms: 50,
            identity: String::new(),
            fabric: FabricConfig::default(),
            worker: WorkerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 55556,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "flowgate-pea".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FabricConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
