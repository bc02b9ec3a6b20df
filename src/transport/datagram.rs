//! 数据报分帧模块 - UDP代理协议的长度前缀编码
//!
//! 一个数据报承载一条代理指令，主题与负载都带长度前缀，
//! 确保在无连接的UDP上消息边界清晰。
//!
//! 格式: [1字节操作码][2字节主题长度][主题UTF-8][4字节负载长度][负载]
//! 长度前缀均为大端序无符号整数

use crate::config::MAX_DATAGRAM_SIZE;

/// 头部固定开销：操作码 + 主题长度 + 负载长度
const HEADER_LEN: usize = 1 + 2 + 4;

/// 代理指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// 建立会话，负载为客户端ID
    Connect = 0x01,
    /// 订阅主题，负载为空
    Subscribe = 0x02,
    /// 发布消息（双向）
    Publish = 0x03,
}

impl TryFrom<u8> for Op {
    type Error = DatagramError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Op::Connect),
            0x02 => Ok(Op::Subscribe),
            0x03 => Ok(Op::Publish),
            other => Err(DatagramError::UnknownOp(other)),
        }
    }
}

/// 分帧错误类型
#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("数据不完整: 当前{current}字节，需要{needed}字节")]
    IncompleteData { current: usize, needed: usize },

    #[error("数据报长度超出限制: {length}字节 (最大{max}字节)")]
    TooLarge { length: usize, max: usize },

    #[error("未知操作码: {0:#04x}")]
    UnknownOp(u8),

    #[error("主题不是合法UTF-8: {0}")]
    InvalidTopic(#[from] std::str::Utf8Error),

    #[error("数据报尾部有{0}字节多余数据")]
    TrailingBytes(usize),
}

/// 解析出的数据报
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub op: Op,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// 编码数据报
pub fn encode(op: Op, topic: &str, payload: &[u8]) -> Result<Vec<u8>, DatagramError> {
    let length = HEADER_LEN + topic.len() + payload.len();
    if length > MAX_DATAGRAM_SIZE || topic.len() > u16::MAX as usize {
        return Err(DatagramError::TooLarge {
            length,
            max: MAX_DATAGRAM_SIZE,
        });
    }

    let mut out = Vec::with_capacity(length);
    out.push(op as u8);
    out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);

    Ok(out)
}

/// 解析一个完整数据报
pub fn decode(data: &[u8]) -> Result<Datagram, DatagramError> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::TooLarge {
            length: data.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    if data.len() < 3 {
        return Err(DatagramError::IncompleteData {
            current: data.len(),
            needed: 3,
        });
    }

    let op = Op::try_from(data[0])?;

    // 主题
    let topic_len = u16::from_be_bytes([data[1], data[2]]) as usize;
    let topic_end = 3 + topic_len;
    if data.len() < topic_end + 4 {
        return Err(DatagramError::IncompleteData {
            current: data.len(),
            needed: topic_end + 4,
        });
    }
    let topic = std::str::from_utf8(&data[3..topic_end])?.to_string();

    // 负载
    let len_bytes: [u8; 4] = [
        data[topic_end],
        data[topic_end + 1],
        data[topic_end + 2],
        data[topic_end + 3],
    ];
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    let payload_start = topic_end + 4;
    let needed = payload_start + payload_len;
    if data.len() < needed {
        return Err(DatagramError::IncompleteData {
            current: data.len(),
            needed,
        });
    }
    if data.len() > needed {
        return Err(DatagramError::TrailingBytes(data.len() - needed));
    }

    Ok(Datagram {
        op,
        topic,
        payload: data[payload_start..needed].to_vec(),
    })
}
