//! 发布器 - 连接保活、有界重连退避、IV与分块的顺序发送

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cipher::{CipherFrame, IV_LEN};
use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::{Result, TelemetryError};
use crate::session::{ChunkPlan, SessionId, plan_chunks};
use crate::transport::message::TelemetryMessage;
use crate::transport::{RetryPolicy, Transport};

/// 发布器参数
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub device_id: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
    pub retry: RetryPolicy,
    /// 相邻分块之间的等待
    pub chunk_pacing: Duration,
}

impl From<&NodeConfig> for PublisherSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            publish_topic: config.publish_topic.clone(),
            subscribe_topic: config.subscribe_topic.clone(),
            retry: config.retry,
            chunk_pacing: config.chunk_pacing,
        }
    }
}

/// 一批分块的发送结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub total_chunks: u32,
    /// 发布成功
    pub sent: u32,
    /// 发布失败后丢弃（不重试）
    pub dropped: u32,
    /// 重连失败后未尝试发送
    pub skipped: u32,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.sent == self.total_chunks
    }
}

/// 遥测发布器
///
/// 尽力而为：单个分块发布失败只记录日志并丢弃，不在批次内重试。
pub struct Publisher<T: Transport> {
    transport: T,
    clock: Rc<dyn Clock>,
    settings: PublisherSettings,
}

impl<T: Transport> Publisher<T> {
    pub fn new(transport: T, clock: Rc<dyn Clock>, settings: PublisherSettings) -> Self {
        Self {
            transport,
            clock,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// 启动时的首次连接
    ///
    /// `timeout` 为 `None` 时一直重试直到成功；否则超时后返回 `Connect` 错误。
    pub fn bootstrap_connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        let started = self.clock.now_ms();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.transport.connect() {
                Ok(()) => {
                    info!("首次连接成功（第{}次尝试）", attempt);
                    self.subscribe_results();
                    return Ok(());
                }
                Err(e) => warn!("首次连接失败（第{}次尝试）: {}", attempt, e),
            }

            if let Some(limit) = timeout {
                let elapsed = self.clock.now_ms().saturating_sub(started);
                if elapsed >= limit.as_millis() as u64 {
                    return Err(TelemetryError::Connect(format!(
                        "{}次尝试后仍未连接，已超过 {:?}",
                        attempt, limit
                    )));
                }
            }
            self.clock.sleep(self.settings.retry.base_delay);
        }
    }

    fn subscribe_results(&mut self) {
        match self.transport.subscribe(&self.settings.subscribe_topic) {
            Ok(()) => debug!("已订阅 {}", self.settings.subscribe_topic),
            Err(e) => warn!("订阅 {} 失败: {}", self.settings.subscribe_topic, e),
        }
    }

    /// 确认连接可用，断开时按线性退避有限次重连
    pub fn ensure_connected(&mut self) -> bool {
        if self.transport.is_connected() {
            return true;
        }

        let retry = self.settings.retry;
        warn!("连接已断开，开始重连（最多{}次）", retry.max_attempts);

        for attempt in 1..=retry.max_attempts {
            match self.transport.connect() {
                Ok(()) => {
                    info!("第{}次重连成功", attempt);
                    self.subscribe_results();
                    return true;
                }
                Err(e) => {
                    warn!("第{}/{}次重连失败: {}", attempt, retry.max_attempts, e);
                    if attempt < retry.max_attempts {
                        self.clock.sleep(retry.delay_for(attempt));
                    }
                }
            }
        }

        error!("重连{}次均失败", retry.max_attempts);
        false
    }

    /// 发布IV消息，不等待确认
    pub fn publish_iv(&mut self, session: &SessionId, sample_id: &str, iv: &[u8; IV_LEN]) -> Result<()> {
        if !self.ensure_connected() {
            return Err(TelemetryError::Connect("无可用连接，跳过IV发布".into()));
        }

        let message = TelemetryMessage::iv(
            &self.settings.device_id,
            self.clock.now_ms(),
            sample_id,
            session,
            iv,
        );
        self.send(&message)?;
        debug!("IV已发布: 会话={}, 批次={}", session, sample_id);
        Ok(())
    }

    /// 按序号递增顺序发布分块
    pub fn publish_chunks(&mut self, session: &SessionId, sample_id: &str, plan: &ChunkPlan) -> PublishReport {
        let mut report = PublishReport {
            total_chunks: plan.total(),
            ..PublishReport::default()
        };

        for (i, chunk) in plan.chunks().iter().enumerate() {
            if i > 0 && !self.settings.chunk_pacing.is_zero() {
                self.clock.sleep(self.settings.chunk_pacing);
            }

            if !self.ensure_connected() {
                report.skipped = plan.total() - i as u32;
                error!(
                    "无可用连接，批次 {} 剩余 {} 个分块未发送",
                    sample_id, report.skipped
                );
                break;
            }

            let message = TelemetryMessage::chunk(
                &self.settings.device_id,
                self.clock.now_ms(),
                sample_id,
                session,
                chunk,
            );
            match self.send(&message) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.dropped += 1;
                    warn!("分块 {}/{} 发布失败，已丢弃: {}", chunk.index, chunk.total, e);
                }
            }
        }

        report
    }

    /// 发布一帧：先IV，后分块
    ///
    /// IV发布失败时整批跳过（接收方没有IV无法解密）。
    pub fn publish_frame(
        &mut self,
        session: &SessionId,
        sample_id: &str,
        frame: &CipherFrame,
        chunk_size: usize,
    ) -> Result<PublishReport> {
        let plan = plan_chunks(&frame.ciphertext, chunk_size)?;
        self.publish_iv(session, sample_id, &frame.iv)?;

        let report = self.publish_chunks(session, sample_id, &plan);
        info!(
            "批次 {} 发送完成: {}/{} 个分块成功, {} 个丢弃, {} 个跳过",
            sample_id, report.sent, report.total_chunks, report.dropped, report.skipped
        );
        Ok(report)
    }

    /// 处理入站消息：只记录日志
    pub fn service_inbound(&mut self) -> usize {
        let result = self.transport.poll(&mut |topic: &str, payload: &[u8]| {
            info!("收到服务端消息 [{}]: {}", topic, String::from_utf8_lossy(payload));
        });

        match result {
            Ok(count) => count,
            Err(e) => {
                warn!("轮询入站消息失败: {}", e);
                0
            }
        }
    }

    fn send(&mut self, message: &TelemetryMessage) -> Result<()> {
        let payload = message.to_json()?;
        self.transport.publish(&self.settings.publish_topic, &payload)
    }
}
