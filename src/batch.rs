//! 样本批次与归一化

/// 固定容量的原始样本批次
#[derive(Debug, Clone)]
pub struct SampleBatch {
    samples: Vec<f32>,
    capacity: usize,
}

impl SampleBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加一个样本；批次已满时返回 false 并丢弃该样本
    pub fn push(&mut self, sample: f32) -> bool {
        if self.is_full() {
            return false;
        }
        self.samples.push(sample);
        true
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// 清空样本，开始下一批
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// 最小-最大归一化到 [0, 1]
///
/// 常量批次（max == min）输出全零，而不是除以零。
pub fn normalize(raw: &[f32]) -> Vec<f32> {
    let Some(&first) = raw.first() else {
        return Vec::new();
    };

    let (min, max) = raw
        .iter()
        .fold((first, first), |(min, max), &x| (min.min(x), max.max(x)));

    let range = max - min;
    if range == 0.0 {
        return vec![0.0; raw.len()];
    }

    raw.iter().map(|&x| (x - min) / range).collect()
}

/// 批次预览（保留4位小数），用于调试日志
pub fn format_batch_preview(samples: &[f32]) -> String {
    let values: Vec<String> = samples.iter().map(|v| format!("{:.4}", v)).collect();
    format!("[{}]", values.join(", "))
}
