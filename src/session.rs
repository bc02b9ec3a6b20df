//! 会话与分块规划
//!
//! 每次运行生成一个会话ID，把IV消息和后续分块消息关联起来；
//! 密文按传输尺寸切分为从1开始编号的分块，负载以小写十六进制编码。

use std::fmt;

use tracing::debug;
use uuid::Builder;

use crate::error::{Result, TelemetryError};
use crate::rng::{self, EntropySource};

/// 运行期会话ID，进程生命周期内保持不变
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// 生成新会话ID
    ///
    /// 16字节随机数的前6字节替换为启动以来的毫秒数（48位大端），
    /// 再按UUID格式输出。
    pub fn generate(entropy: &dyn EntropySource, uptime_ms: u64) -> Result<Self> {
        let mut bytes = rng::random_array::<16>(entropy, rng::SESSION_PERSONALIZATION)?;
        bytes[..6].copy_from_slice(&uptime_ms.to_be_bytes()[2..]);

        let uuid = Builder::from_random_bytes(bytes).into_uuid();
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 批次标识，批次序号从1开始
pub fn sample_id(batch_seq: u64) -> String {
    format!("sample_{}", batch_seq)
}

/// 单个分块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 从1开始的序号
    pub index: u32,

    /// 分块总数
    pub total: u32,

    /// 十六进制编码的分块字节
    pub data_hex: String,
}

impl Chunk {
    /// 分块原始字节数
    pub fn byte_len(&self) -> usize {
        self.data_hex.len() / 2
    }
}

/// 一帧密文的分块计划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<Chunk>,
    payload_len: usize,
    chunk_size: usize,
}

impl ChunkPlan {
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn total(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// 把负载切分为 ceil(len / chunk_size) 个分块
///
/// 最后一块长度为 len - (count-1) * chunk_size，可能小于 chunk_size。
pub fn plan_chunks(payload: &[u8], chunk_size: usize) -> Result<ChunkPlan> {
    if chunk_size == 0 {
        return Err(TelemetryError::Config("分块大小必须大于0".into()));
    }

    let count = payload.len().div_ceil(chunk_size);
    let total = u32::try_from(count)
        .map_err(|_| TelemetryError::Config(format!("分块数 {} 超出范围", count)))?;

    let chunks: Vec<Chunk> = payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, bytes)| Chunk {
            index: i as u32 + 1,
            total,
            data_hex: hex::encode(bytes),
        })
        .collect();

    debug!(
        "分块规划: 负载{}字节, 块大小{}字节, 共{}块",
        payload.len(),
        chunk_size,
        total
    );

    Ok(ChunkPlan {
        chunks,
        payload_len: payload.len(),
        chunk_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingEntropy(Cell<u8>);

    impl EntropySource for CountingEntropy {
        fn fill_entropy(&self, dest: &mut [u8]) -> Result<()> {
            let n = self.0.get();
            self.0.set(n.wrapping_add(1));
            dest.fill(n);
            Ok(())
        }
    }

    #[test]
    fn test_standard_frame_chunking() {
        let payload: Vec<u8> = (0..752).map(|i| (i % 251) as u8).collect();
        let plan = plan_chunks(&payload, 32).unwrap();

        assert_eq!(plan.total(), 24);
        assert_eq!(plan.chunks().len(), 24);
        assert_eq!(plan.payload_len(), 752);
        assert_eq!(plan.chunk_size(), 32);
        let last = plan.chunks().last().unwrap();
        assert_eq!(last.index, 24);
        assert_eq!(last.byte_len(), 752 - 23 * 32);
        assert_eq!(last.byte_len(), 16);
    }

    #[test]
    fn test_concatenated_chunks_reconstruct_payload() {
        let payload: Vec<u8> = (0..100u8).collect();
        let plan = plan_chunks(&payload, 30).unwrap();

        assert_eq!(plan.total(), 4);
        let mut rebuilt = Vec::new();
        for (i, chunk) in plan.chunks().iter().enumerate() {
            assert_eq!(chunk.index as usize, i + 1);
            assert_eq!(chunk.total, 4);
            rebuilt.extend(hex::decode(&chunk.data_hex).unwrap());
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_exact_multiple_and_oversized_chunk() {
        let payload = [0xabu8; 64];
        let plan = plan_chunks(&payload, 16).unwrap();
        assert_eq!(plan.total(), 4);
        assert!(plan.chunks().iter().all(|c| c.byte_len() == 16));

        let plan = plan_chunks(&payload, 1000).unwrap();
        assert_eq!(plan.total(), 1);
        assert_eq!(plan.chunks()[0].data_hex, "ab".repeat(64));
    }

    #[test]
    fn test_hex_is_lowercase() {
        let plan = plan_chunks(&[0xde, 0xad, 0xbe, 0xef], 4).unwrap();
        assert_eq!(plan.chunks()[0].data_hex, "deadbeef");
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(plan_chunks(&[1, 2, 3], 0), Err(TelemetryError::Config(_))));
    }

    #[test]
    fn test_session_id_embeds_uptime_and_differs() {
        let entropy = CountingEntropy(Cell::new(0));
        let a = SessionId::generate(&entropy, 0x0102_0304_0506).unwrap();
        let b = SessionId::generate(&entropy, 0x0102_0304_0506).unwrap();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("01020304-0506-4"));
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(a.to_string(), a.as_str());
    }

    #[test]
    fn test_sample_id_format() {
        assert_eq!(sample_id(1), "sample_1");
        assert_eq!(sample_id(42), "sample_42");
    }
}
