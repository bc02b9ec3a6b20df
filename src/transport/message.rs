//! 发布消息结构（JSON）
//!
//! `message_type` 作为内部标签：`"iv"` 或 `"data_chunk"`。

use serde::{Deserialize, Serialize};

use crate::cipher::IV_LEN;
use crate::session::{Chunk, SessionId};

/// IV消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvMessage {
    pub device_id: String,
    /// 启动以来的毫秒数
    pub timestamp: u64,
    pub sample_id: String,
    pub session_id: String,
    /// 16字节IV的小写十六进制（32个字符）
    pub iv: String,
}

/// 分块消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub device_id: String,
    pub timestamp: u64,
    pub sample_id: String,
    pub session_id: String,
    /// 从1开始
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// 分块字节的小写十六进制
    pub chunk_data: String,
}

/// 发布到 `ecg/data` 的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum TelemetryMessage {
    Iv(IvMessage),
    DataChunk(ChunkMessage),
}

impl TelemetryMessage {
    pub fn iv(
        device_id: &str,
        timestamp: u64,
        sample_id: &str,
        session: &SessionId,
        iv: &[u8; IV_LEN],
    ) -> Self {
        TelemetryMessage::Iv(IvMessage {
            device_id: device_id.to_string(),
            timestamp,
            sample_id: sample_id.to_string(),
            session_id: session.as_str().to_string(),
            iv: hex::encode(iv),
        })
    }

    pub fn chunk(
        device_id: &str,
        timestamp: u64,
        sample_id: &str,
        session: &SessionId,
        chunk: &Chunk,
    ) -> Self {
        TelemetryMessage::DataChunk(ChunkMessage {
            device_id: device_id.to_string(),
            timestamp,
            sample_id: sample_id.to_string(),
            session_id: session.as_str().to_string(),
            chunk_index: chunk.index,
            total_chunks: chunk.total,
            chunk_data: chunk.data_hex.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        match self {
            TelemetryMessage::Iv(m) => &m.session_id,
            TelemetryMessage::DataChunk(m) => &m.session_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
