//! ECG Link - 设备端安全遥测管线核心库
//!
//! 采集一批心电样本，归一化后用持久化的 AES-256 密钥和每批新的随机IV
//! 做 CBC 加密，再按会话关联、分块编号的方式发布到尺寸受限的发布/订阅通道。

/// 错误类型
pub mod error;

/// 节点配置
pub mod config;

/// 时钟抽象
pub mod clock;

/// 熵源与 HMAC-DRBG
pub mod rng;

/// 密钥存储
pub mod keystore;

/// 样本批次与归一化
pub mod batch;

/// 填充与 AES-256-CBC 加密
pub mod cipher;

/// 会话ID与分块规划
pub mod session;

/// 发布/订阅传输
pub mod transport;

/// 样本源
pub mod source;

/// 采集管线状态机
pub mod pipeline;

/// 重新导出常用类型
pub use cipher::{CipherFrame, encrypt_batch};
pub use config::NodeConfig;
pub use error::{Result, TelemetryError};
pub use keystore::{FileStore, KeyStore, MemoryStore, SymmetricKey};
pub use pipeline::{Pipeline, PipelineState};
pub use session::{SessionId, plan_chunks};
pub use transport::{Publisher, Transport};

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 日志系统
pub mod logging;
