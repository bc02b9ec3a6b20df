//! 内存代理传输
//!
//! 克隆体共享同一个代理状态，测试可以在把传输交给发布器之后
//! 继续注入故障、检查已发布的消息。

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::error::{Result, TelemetryError};
use crate::transport::Transport;

/// 已发布的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    connect_attempts: usize,
    /// 接下来还要失败的连接次数
    failing_connects: usize,
    refuse_connects: bool,
    publish_calls: usize,
    /// 第n次（从1开始）publish调用失败
    failing_publish_calls: HashSet<usize>,
    /// 第n次publish调用之后断开连接
    disconnect_after_call: Option<usize>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
    inbound: VecDeque<PublishedMessage>,
}

/// 内存传输（用于测试）
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<BrokerState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 n 次连接失败
    pub fn fail_next_connects(&self, n: usize) {
        self.state.borrow_mut().failing_connects = n;
    }

    /// 持续拒绝连接
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.borrow_mut().refuse_connects = refuse;
    }

    /// 让第 n 次 publish 调用失败
    pub fn fail_publish_call(&self, n: usize) {
        self.state.borrow_mut().failing_publish_calls.insert(n);
    }

    /// 在第 n 次 publish 调用之后断开连接
    pub fn disconnect_after_call(&self, n: usize) {
        self.state.borrow_mut().disconnect_after_call = Some(n);
    }

    /// 模拟链路断开
    pub fn drop_connection(&self) {
        self.state.borrow_mut().connected = false;
    }

    /// 模拟服务端下发消息
    pub fn inject_inbound(&self, topic: &str, payload: &[u8]) {
        self.state.borrow_mut().inbound.push_back(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.borrow().published.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.borrow().connect_attempts
    }

    pub fn publish_calls(&self) -> usize {
        self.state.borrow().publish_calls
    }

    /// 尚未被取走的入站消息数
    pub fn pending_inbound(&self) -> usize {
        self.state.borrow().inbound.len()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.borrow().subscriptions.clone()
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.connect_attempts += 1;

        if state.refuse_connects {
            return Err(TelemetryError::Connect("代理拒绝连接".into()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TelemetryError::Connect("模拟连接失败".into()));
        }

        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(TelemetryError::Publish("未连接".into()));
        }

        state.publish_calls += 1;
        let call = state.publish_calls;

        let result = if state.failing_publish_calls.contains(&call) {
            Err(TelemetryError::Publish(format!("模拟第{}次发布失败", call)))
        } else {
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
            Ok(())
        };

        if state.disconnect_after_call == Some(call) {
            state.connected = false;
        }

        result
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(TelemetryError::Connect("未连接，无法订阅".into()));
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> Result<usize> {
        // 先取出消息再回调，回调期间不持有借用
        let delivered: Vec<PublishedMessage> = {
            let mut state = self.state.borrow_mut();
            let subscriptions = state.subscriptions.clone();
            let (matched, rest): (Vec<_>, Vec<_>) = state
                .inbound
                .drain(..)
                .partition(|m| subscriptions.contains(&m.topic));
            state.inbound = rest.into();
            matched
        };

        for message in &delivered {
            on_message(&message.topic, &message.payload);
        }
        Ok(delivered.len())
    }
}
