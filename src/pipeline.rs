//! 采集管线状态机
//!
//! 一个周期依次经过 采集 → 处理 → 发送 → 等待 四个阶段。
//! 所有阶段共享的数据放在 [`PipelineContext`] 中，由 [`Pipeline::step`]
//! 每次推进一个转换；全程单线程，唯一的挂起点是 [`Clock::sleep`]。

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::batch::{self, SampleBatch};
use crate::cipher;
use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::keystore::{KeyStore, KeyValueStore, SymmetricKey};
use crate::rng::EntropySource;
use crate::session::{self, SessionId};
use crate::source::SampleSource;
use crate::transport::{PublishReport, Publisher, PublisherSettings, Transport};

/// 管线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// 按采样间隔读取样本，直到批次填满
    Collecting,
    /// 归一化
    Processing,
    /// 加密并发布
    Sending,
    /// 批次间休息，处理入站消息
    Waiting,
}

/// 跨阶段传递的数据
#[derive(Debug)]
pub struct PipelineContext {
    pub batch: SampleBatch,
    normalized: Option<Vec<f32>>,
    /// 已进入发送阶段的批次数，也是当前 `sample_id` 的序号
    batch_seq: u64,
    last_reading_ms: Option<u64>,
}

impl PipelineContext {
    fn new(batch_size: usize) -> Self {
        Self {
            batch: SampleBatch::new(batch_size),
            normalized: None,
            batch_seq: 0,
            last_reading_ms: None,
        }
    }

    pub fn batch_seq(&self) -> u64 {
        self.batch_seq
    }

    pub fn normalized(&self) -> Option<&[f32]> {
        self.normalized.as_deref()
    }
}

/// 运行统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// IV已发布的批次
    pub batches_sent: u64,
    /// 因加密或连接失败整批放弃的批次
    pub batches_skipped: u64,
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
    pub chunks_skipped: u64,
}

impl PipelineStats {
    fn record(&mut self, report: &PublishReport) {
        self.batches_sent += 1;
        self.chunks_sent += u64::from(report.sent);
        self.chunks_dropped += u64::from(report.dropped);
        self.chunks_skipped += u64::from(report.skipped);
    }
}

/// 设备端遥测管线
pub struct Pipeline<T: Transport> {
    config: NodeConfig,
    key: SymmetricKey,
    session: SessionId,
    entropy: Box<dyn EntropySource>,
    clock: Rc<dyn Clock>,
    source: Box<dyn SampleSource>,
    publisher: Publisher<T>,
    state: PipelineState,
    ctx: PipelineContext,
    stats: PipelineStats,
}

impl<T: Transport> Pipeline<T> {
    /// 启动：校验配置、引导密钥、生成会话、首次连接
    ///
    /// 密钥引导失败是致命错误，不会进入采集阶段。
    pub fn bootstrap<S: KeyValueStore>(
        config: NodeConfig,
        store: S,
        entropy: Box<dyn EntropySource>,
        transport: T,
        clock: Rc<dyn Clock>,
        source: Box<dyn SampleSource>,
    ) -> Result<Self> {
        config.validate()?;

        let mut keystore = KeyStore::with_location(store, &config.key_namespace, &config.key_name);
        let key = keystore.bootstrap(entropy.as_ref())?;

        let session = SessionId::generate(entropy.as_ref(), clock.now_ms())?;
        info!("会话ID: {}", session);

        let mut publisher = Publisher::new(transport, Rc::clone(&clock), PublisherSettings::from(&config));
        publisher.bootstrap_connect(config.bootstrap_connect_timeout)?;

        info!(
            "管线就绪: 设备={}, 每批{}个样本, 分块{}字节",
            config.device_id, config.batch_size, config.chunk_size
        );

        let ctx = PipelineContext::new(config.batch_size);
        Ok(Self {
            config,
            key,
            session,
            entropy,
            clock,
            source,
            publisher,
            state: PipelineState::Collecting,
            ctx,
            stats: PipelineStats::default(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher<T> {
        &self.publisher
    }

    /// 推进一个转换，返回新的阶段
    pub fn step(&mut self) -> PipelineState {
        self.state = match self.state {
            PipelineState::Collecting => self.collect(),
            PipelineState::Processing => self.process(),
            PipelineState::Sending => self.send(),
            PipelineState::Waiting => self.wait(),
        };
        self.state
    }

    /// 运行若干个完整周期后返回
    pub fn run_batches(&mut self, count: u64) {
        let target = self.ctx.batch_seq + count;
        while !(self.ctx.batch_seq >= target && self.state == PipelineState::Collecting) {
            self.step();
        }
    }

    /// 一直运行，直到复位或掉电
    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }

    fn collect(&mut self) -> PipelineState {
        if let Some(last) = self.ctx.last_reading_ms {
            let interval = self.config.sampling_interval.as_millis() as u64;
            let elapsed = self.clock.now_ms().saturating_sub(last);
            if elapsed < interval {
                self.clock.sleep(Duration::from_millis(interval - elapsed));
            }
        }

        let reading = self.source.read();
        self.ctx.last_reading_ms = Some(self.clock.now_ms());
        self.ctx.batch.push(reading);

        if self.ctx.batch.is_full() {
            info!("采集完成: {} 个样本", self.ctx.batch.len());
            PipelineState::Processing
        } else {
            PipelineState::Collecting
        }
    }

    fn process(&mut self) -> PipelineState {
        let normalized = batch::normalize(self.ctx.batch.samples());
        debug!("归一化结果: {}", batch::format_batch_preview(&normalized));
        self.ctx.normalized = Some(normalized);
        PipelineState::Sending
    }

    fn send(&mut self) -> PipelineState {
        self.ctx.batch_seq += 1;
        let sample_id = session::sample_id(self.ctx.batch_seq);

        let mut normalized = self
            .ctx
            .normalized
            .take()
            .unwrap_or_else(|| batch::normalize(self.ctx.batch.samples()));

        match self.encrypt_and_publish(&sample_id, &normalized) {
            Ok(report) => self.stats.record(&report),
            Err(e) => {
                self.stats.batches_skipped += 1;
                error!("批次 {} 已放弃: {}", sample_id, e);
            }
        }

        normalized.zeroize();
        PipelineState::Waiting
    }

    fn encrypt_and_publish(&mut self, sample_id: &str, normalized: &[f32]) -> Result<PublishReport> {
        let frame = cipher::encrypt_batch(normalized, &self.key, self.entropy.as_ref())?;
        info!(
            "批次 {} 已加密: 密文{}字节（含IV共{}字节）",
            sample_id,
            frame.ciphertext.len(),
            frame.total_len()
        );

        let report = self
            .publisher
            .publish_frame(&self.session, sample_id, &frame, self.config.chunk_size)?;
        if !report.is_complete() {
            warn!(
                "批次 {} 未完整发送: {}/{}",
                sample_id, report.sent, report.total_chunks
            );
        }
        Ok(report)
    }

    fn wait(&mut self) -> PipelineState {
        self.clock.sleep(self.config.cycle_pause);
        let inbound = self.publisher.service_inbound();
        if inbound > 0 {
            debug!("处理了 {} 条入站消息", inbound);
        }

        self.ctx.batch.reset();
        self.ctx.last_reading_ms = None;
        PipelineState::Collecting
    }
}
