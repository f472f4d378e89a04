//! 实时消息核心配置模块
//!
//! - TOML 配置文件加载（所有字段都有默认值）
//! - 环境变量覆盖
//! - 配置校验
//!
//! 配置对象显式传入 `RealtimeRuntime::build`，不使用全局实例。

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::warn;

use crate::domain::value_object::Destination;

/// 会话存储配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis 服务器地址
    pub redis_url: String,
    /// 会话相关键的过期时间（秒）
    pub session_ttl_seconds: u64,
    /// 单次存储操作超时（毫秒）
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            session_ttl_seconds: 1800, // 30分钟
            operation_timeout_ms: 500,
        }
    }
}

/// 心跳与后台清理配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// 心跳超时（秒）
    pub timeout_seconds: u64,
    /// 清理周期（秒）
    pub sweep_interval_seconds: u64,
    /// 单批次最多处理的条目数
    pub sweep_batch_size: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 90,
            sweep_interval_seconds: 30,
            sweep_batch_size: 500,
        }
    }
}

/// 授权服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// HTTP 授权服务地址
    pub endpoint: Option<String>,
    /// 调用超时（毫秒）
    pub timeout_ms: u64,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 1000,
        }
    }
}

/// 投递配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 扇出并发上限
    pub max_concurrency: usize,
    /// 每个连接的下行缓冲
    pub outbound_buffer: usize,
    /// 异步投递队列容量
    pub queue_capacity: usize,
    /// 队列消息最大投递次数
    pub max_attempts: u32,
    /// 重试基础间隔（毫秒）
    pub retry_delay_ms: u64,
    /// 全局广播主题
    pub broadcast_topic: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            outbound_buffer: 256,
            queue_capacity: 1024,
            max_attempts: 3,
            retry_delay_ms: 200,
            broadcast_topic: "/topic/global/broadcast".to_string(),
        }
    }
}

/// 路由配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// 消息类型 -> 兜底主题（覆盖内置兜底表）
    pub fallback: HashMap<String, String>,
    /// 自定义消息类型的兜底主题前缀
    pub default_topic: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fallback: HashMap::new(),
            default_topic: "/topic/global".to_string(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
    /// 输出 JSON 格式
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            json: false,
        }
    }
}

/// 实时消息核心配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 当前服务节点ID
    pub node_id: String,
    /// 存储键命名空间
    pub namespace: String,
    pub store: StoreConfig,
    pub heartbeat: HeartbeatConfig,
    pub authorization: AuthorizationConfig,
    pub dispatch: DispatchConfig,
    pub routing: RoutingConfig,
    pub logging: LoggingConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            namespace: "realtime".to_string(),
            store: StoreConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            authorization: AuthorizationConfig::default(),
            dispatch: DispatchConfig::default(),
            routing: RoutingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// 加载配置
    ///
    /// 未指定路径时依次尝试 `config/realtime.toml`、`realtime.toml`，
    /// 都不存在则使用默认配置。随后应用环境变量覆盖并校验。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let candidates = [
                    PathBuf::from("config/realtime.toml"),
                    PathBuf::from("realtime.toml"),
                ];
                match candidates.iter().find(|p| p.exists()) {
                    Some(p) => Self::from_file(p)?,
                    None => {
                        warn!("no realtime configuration file found, falling back to defaults");
                        Self::default()
                    }
                }
            }
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// 从文件加载
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config format: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: RealtimeConfig = toml::from_str(content)?;
        Ok(cfg)
    }

    /// 环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        if let Ok(node_id) = env::var("REALTIME_NODE_ID") {
            self.node_id = node_id;
        }
        if let Ok(namespace) = env::var("REALTIME_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(url) = env::var("REALTIME_REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(ttl) = env::var("REALTIME_SESSION_TTL")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            self.store.session_ttl_seconds = ttl;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(anyhow!("node_id cannot be empty"));
        }
        if self.store.session_ttl_seconds == 0 {
            return Err(anyhow!("store.session_ttl_seconds must be positive"));
        }
        if self.store.operation_timeout_ms == 0 || self.authorization.timeout_ms == 0 {
            return Err(anyhow!("timeouts must be positive"));
        }
        if self.heartbeat.timeout_seconds == 0 || self.heartbeat.sweep_interval_seconds == 0 {
            return Err(anyhow!("heartbeat intervals must be positive"));
        }
        if self.dispatch.max_concurrency == 0
            || self.dispatch.outbound_buffer == 0
            || self.dispatch.queue_capacity == 0
        {
            return Err(anyhow!("dispatch capacities must be positive"));
        }
        Destination::parse(&self.dispatch.broadcast_topic)
            .with_context(|| "dispatch.broadcast_topic is not a valid destination")?;
        for (message_type, topic) in &self.routing.fallback {
            let destination = Destination::parse(topic).with_context(|| {
                format!("invalid fallback topic for {}: {}", message_type, topic)
            })?;
            if destination.is_direct() || destination.is_application() {
                return Err(anyhow!(
                    "fallback topic for {} must be a /topic destination: {}",
                    message_type,
                    topic
                ));
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.store.session_ttl_seconds)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.operation_timeout_ms)
    }

    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_millis(self.authorization.timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.sweep_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch.retry_delay_ms)
    }
}

fn default_node_id() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]))
}
