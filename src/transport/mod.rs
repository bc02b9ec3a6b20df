//! 传输模块 - 发布/订阅通道上的分块发送

use std::time::Duration;

use crate::error::Result;

/// 数据报编解码
pub mod datagram;

/// 发布消息结构
pub mod message;

/// 内存代理传输（测试用）
pub mod memory;

/// UDP 代理传输
pub mod udp;

/// 发布器：连接保活、重试退避、IV与分块发送
pub mod publisher;

// 重新导出公共类型
pub use memory::{MemoryTransport, PublishedMessage};
pub use message::{ChunkMessage, IvMessage, TelemetryMessage};
pub use publisher::{PublishReport, Publisher, PublisherSettings};
pub use udp::UdpTransport;

/// 发布/订阅传输
///
/// 传输层不保证投递顺序，接收方依靠 `session_id` + `chunk_index` 重组。
pub trait Transport {
    fn connect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;

    fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// 取出已到达的入站消息，逐条交给回调，返回处理条数
    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> Result<usize>;
}

/// 有界重连策略：第 n 次失败后等待 n * base_delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}
