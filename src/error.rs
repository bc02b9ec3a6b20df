//! 错误类型定义
//!
//! 整个遥测管线共用一个错误枚举，对应五类故障：
//! 随机数、存储、加密、连接、发布。另有配置与底层IO/序列化错误。

use thiserror::Error;

/// 遥测管线错误
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 熵源或DRBG失败（密钥引导阶段为致命错误，批处理阶段只丢弃当前批次）
    #[error("随机数生成失败: {0}")]
    Rng(String),

    /// 持久化存储读写失败
    #[error("存储失败: {0}")]
    Storage(String),

    /// 分组密码引擎失败
    #[error("加密失败: {0}")]
    Cipher(String),

    /// 传输层连接失败
    #[error("连接失败: {0}")]
    Connect(String),

    /// 单条消息发布失败
    #[error("发布失败: {0}")]
    Publish(String),

    /// 配置无效
    #[error("配置无效: {0}")]
    Config(String),

    #[error("数据报编解码失败: {0}")]
    Datagram(#[from] crate::transport::datagram::DatagramError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
