//! 节点配置
//!
//! 所有缓冲区尺寸都从 `batch_size` 推导，不再写死为 187。

use std::time::Duration;

use crate::error::{Result, TelemetryError};
use crate::transport::RetryPolicy;

/// 每批样本数（训练模型所用数据集每条记录为187个样本）
pub const DEFAULT_BATCH_SIZE: usize = 187;

/// 单个分块携带的密文字节数
pub const DEFAULT_CHUNK_SIZE: usize = 32;

/// 单个UDP数据报的最大尺寸
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// 分块消息中除 `chunk_data` 以外的JSON字段预留字节数
pub const MESSAGE_OVERHEAD_BUDGET: usize = 512;

pub const DEFAULT_PUBLISH_TOPIC: &str = "ecg/data";
pub const DEFAULT_SUBSCRIBE_TOPIC: &str = "ecg/results";

pub const KEY_NAMESPACE: &str = "encryption_key";
pub const KEY_NAME: &str = "key";

/// 节点运行配置
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// 设备标识
    pub device_id: String,

    /// 每批样本数
    pub batch_size: usize,

    /// 分块大小（密文字节）
    pub chunk_size: usize,

    pub publish_topic: String,
    pub subscribe_topic: String,

    /// 采样间隔（10ms = 100Hz）
    pub sampling_interval: Duration,

    /// 两批之间的休息时间
    pub cycle_pause: Duration,

    /// 相邻分块之间的发送间隔
    pub chunk_pacing: Duration,

    /// 稳态重连策略
    pub retry: RetryPolicy,

    /// 启动时首次连接的时限，`None` 表示一直重试直到成功
    pub bootstrap_connect_timeout: Option<Duration>,

    pub key_namespace: String,
    pub key_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: "ecg-device-01".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            publish_topic: DEFAULT_PUBLISH_TOPIC.to_string(),
            subscribe_topic: DEFAULT_SUBSCRIBE_TOPIC.to_string(),
            sampling_interval: Duration::from_millis(10),
            cycle_pause: Duration::from_millis(1000),
            chunk_pacing: Duration::from_millis(20),
            retry: RetryPolicy::default(),
            bootstrap_connect_timeout: None,
            key_namespace: KEY_NAMESPACE.to_string(),
            key_name: KEY_NAME.to_string(),
        }
    }
}

impl NodeConfig {
    /// 校验配置，返回第一个发现的问题
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(TelemetryError::Config("device_id 不能为空".into()));
        }
        if self.batch_size == 0 {
            return Err(TelemetryError::Config("batch_size 必须大于0".into()));
        }
        if self.chunk_size == 0 {
            return Err(TelemetryError::Config("chunk_size 必须大于0".into()));
        }
        // 十六进制编码后长度翻倍
        let hex_len = self.chunk_size.saturating_mul(2);
        if hex_len + MESSAGE_OVERHEAD_BUDGET > MAX_DATAGRAM_SIZE {
            return Err(TelemetryError::Config(format!(
                "chunk_size {} 过大: 编码后超出数据报上限 {} 字节",
                self.chunk_size, MAX_DATAGRAM_SIZE
            )));
        }
        if self.publish_topic.is_empty() || self.subscribe_topic.is_empty() {
            return Err(TelemetryError::Config("主题不能为空".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(TelemetryError::Config("重试次数必须大于0".into()));
        }
        if self.key_namespace.is_empty() || self.key_name.is_empty() {
            return Err(TelemetryError::Config("密钥命名空间与键名不能为空".into()));
        }
        Ok(())
    }

    /// 一批样本序列化后的明文字节数
    pub fn raw_frame_len(&self) -> usize {
        self.batch_size * 4
    }
}
