//! 样本源
//!
//! 每次 `read` 返回一个标量读数，对应模数转换器的一次采样。

/// 12位ADC的满量程
pub const ADC_MAX: f32 = 4095.0;

/// 单通道样本源
pub trait SampleSource {
    fn read(&mut self) -> f32;
}

/// PQRST波形的一个分量：高斯峰 (相位中心, 宽度, 幅度)
struct Wave {
    center: f32,
    width: f32,
    amplitude: f32,
}

const PQRST: [Wave; 5] = [
    Wave { center: 0.20, width: 0.025, amplitude: 180.0 },
    Wave { center: 0.36, width: 0.010, amplitude: -220.0 },
    Wave { center: 0.40, width: 0.012, amplitude: 1500.0 },
    Wave { center: 0.44, width: 0.010, amplitude: -380.0 },
    Wave { center: 0.68, width: 0.040, amplitude: 350.0 },
];

/// 合成心电信号
///
/// 以固定采样率生成周期性的PQRST波形，基线位于量程中点，
/// 输出始终落在 `0..=4095`。
#[derive(Debug, Clone)]
pub struct SyntheticEcg {
    /// 每个心动周期的样本数
    period: u32,
    baseline: f32,
    tick: u64,
}

impl SyntheticEcg {
    /// `sample_rate_hz` 采样率，`heart_rate_bpm` 心率
    pub fn new(sample_rate_hz: u32, heart_rate_bpm: u32) -> Self {
        let bpm = heart_rate_bpm.max(1);
        let period = (sample_rate_hz.max(1) * 60 / bpm).max(1);
        Self {
            period,
            baseline: ADC_MAX / 2.0,
            tick: 0,
        }
    }

    pub fn period(&self) -> u32 {
        self.period
    }
}

impl Default for SyntheticEcg {
    /// 100Hz 采样，72次/分
    fn default() -> Self {
        Self::new(100, 72)
    }
}

impl SampleSource for SyntheticEcg {
    fn read(&mut self) -> f32 {
        let phase = (self.tick % self.period as u64) as f32 / self.period as f32;
        self.tick = self.tick.wrapping_add(1);

        let value = PQRST.iter().fold(self.baseline, |acc, w| {
            let d = (phase - w.center) / w.width;
            acc + w.amplitude * (-0.5 * d * d).exp()
        });

        value.round().clamp(0.0, ADC_MAX)
    }
}

/// 循环回放固定序列
#[derive(Debug, Clone)]
pub struct ReplaySource {
    samples: Vec<f32>,
    pos: usize,
}

impl ReplaySource {
    /// 空序列回放为常量 0
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples, pos: 0 }
    }
}

impl SampleSource for ReplaySource {
    fn read(&mut self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let value = self.samples[self.pos];
        self.pos = (self.pos + 1) % self.samples.len();
        value
    }
}
