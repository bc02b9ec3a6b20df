//! UDP代理传输
//!
//! 每条代理指令占一个数据报（见 [`datagram`](crate::transport::datagram)），
//! 发布不等待确认。入站消息通过 mio 事件轮询非阻塞读取。

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::{Result, TelemetryError};
use crate::transport::Transport;
use crate::transport::datagram::{self, Op};

const SOCKET: Token = Token(0);

/// 单次轮询中允许的连续接收错误数，超过后断开重连
const MAX_RECV_ERRORS: usize = 16;

/// 对端端口关闭（ICMP不可达）等错误意味着需要重新连接
fn is_link_lost(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::NotConnected
    )
}

struct Link {
    socket: UdpSocket,
    poll: Poll,
}

/// 基于UDP的发布/订阅传输
pub struct UdpTransport {
    broker: Url,
    client_id: String,
    link: Option<Link>,
    events: Events,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// `broker` 形如 `udp://host:port`
    pub fn new(broker: &str, client_id: &str) -> Result<Self> {
        let broker = Url::parse(broker)
            .map_err(|e| TelemetryError::Config(format!("代理地址无效 {}: {}", broker, e)))?;
        if broker.scheme() != "udp" {
            return Err(TelemetryError::Config(format!(
                "不支持的代理协议: {}（仅支持 udp://）",
                broker.scheme()
            )));
        }

        Ok(Self {
            broker,
            client_id: client_id.to_string(),
            link: None,
            events: Events::with_capacity(64),
            buf: vec![0; MAX_DATAGRAM_SIZE],
        })
    }

    /// 本地绑定地址（已连接时）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().and_then(|l| l.socket.local_addr().ok())
    }

    fn resolve(&self) -> Result<SocketAddr> {
        self.broker
            .socket_addrs(|| None)
            .map_err(|e| TelemetryError::Connect(format!("解析代理地址失败: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| TelemetryError::Connect("代理地址没有可用的解析结果".into()))
    }

    fn send(&mut self, op: Op, topic: &str, payload: &[u8]) -> Result<()> {
        let frame = datagram::encode(op, topic, payload)?;

        let Some(link) = self.link.as_ref() else {
            return Err(TelemetryError::Publish("未连接".into()));
        };

        match link.socket.send(&frame) {
            Ok(written) if written == frame.len() => {
                trace!("已写入 {written} 字节");
                Ok(())
            }
            Ok(written) => Err(TelemetryError::Publish(format!(
                "数据报被截断: {}/{} 字节",
                written,
                frame.len()
            ))),
            // 发送缓冲区满：丢弃本条，不断开
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("发送操作将阻塞");
                Err(TelemetryError::Publish("发送缓冲区已满".into()))
            }
            Err(e) => {
                warn!("发送失败，标记为断开: {e:?}");
                self.link = None;
                Err(TelemetryError::Publish(e.to_string()))
            }
        }
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<()> {
        let peer_addr = self.resolve()?;

        // 按代理地址的IP族选择绑定地址
        let bind_addr: SocketAddr = match peer_addr {
            SocketAddr::V4(_) => SocketAddr::from(([0u8; 4], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };

        let mut socket = UdpSocket::bind(bind_addr)
            .map_err(|e| TelemetryError::Connect(format!("绑定本地地址失败: {}", e)))?;
        socket
            .connect(peer_addr)
            .map_err(|e| TelemetryError::Connect(format!("连接 {} 失败: {}", peer_addr, e)))?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE)?;

        self.link = Some(Link { socket, poll });

        let client_id = self.client_id.clone();
        if let Err(e) = self.send(Op::Connect, "", client_id.as_bytes()) {
            self.link = None;
            return Err(TelemetryError::Connect(e.to_string()));
        }

        info!("已连接到代理 {} (本地 {:?})", peer_addr, self.local_addr());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.send(Op::Publish, topic, payload)
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.send(Op::Subscribe, topic, &[])
            .map_err(|e| TelemetryError::Connect(format!("订阅 {} 失败: {}", topic, e)))
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) -> Result<usize> {
        let Some(link) = self.link.as_mut() else {
            return Ok(0);
        };

        link.poll.poll(&mut self.events, Some(Duration::ZERO))?;
        if self.events.is_empty() {
            return Ok(0);
        }

        // 边沿触发：必须读到 WouldBlock 为止，否则已排队的数据报不会再触发事件
        let mut delivered = 0;
        let mut errors = 0;
        let mut lost = None;
        loop {
            let len = match link.socket.recv(&mut self.buf) {
                Ok(len) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if is_link_lost(&e) => {
                    lost = Some(e);
                    break;
                }
                Err(e) => {
                    errors += 1;
                    warn!("接收失败: {e:?}");
                    if errors >= MAX_RECV_ERRORS {
                        lost = Some(e);
                        break;
                    }
                    continue;
                }
            };

            match datagram::decode(&self.buf[..len]) {
                Ok(dg) if dg.op == Op::Publish => {
                    on_message(&dg.topic, &dg.payload);
                    delivered += 1;
                }
                Ok(dg) => debug!("忽略代理指令 {:?}", dg.op),
                Err(e) => warn!("丢弃无法解析的数据报: {}", e),
            }
        }

        if let Some(e) = lost {
            warn!("代理不可达，标记为断开: {e:?}");
            self.link = None;
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;

    fn broker() -> (StdUdpSocket, String) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let url = format!("udp://{}", socket.local_addr().unwrap());
        (socket, url)
    }

    fn recv_datagram(socket: &StdUdpSocket) -> (datagram::Datagram, SocketAddr) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        (datagram::decode(&buf[..len]).unwrap(), from)
    }

    #[test]
    fn test_rejects_non_udp_scheme() {
        assert!(matches!(
            UdpTransport::new("tcp://127.0.0.1:1883", "node"),
            Err(TelemetryError::Config(_))
        ));
        assert!(UdpTransport::new("not a url", "node").is_err());
    }

    #[test]
    fn test_publish_before_connect_fails() {
        let mut transport = UdpTransport::new("udp://127.0.0.1:9", "node").unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("ecg/data", b"{}"),
            Err(TelemetryError::Publish(_))
        ));
    }

    #[test]
    fn test_connect_publish_and_receive() {
        let (broker, url) = broker();
        let mut transport = UdpTransport::new(&url, "ecg-device-01").unwrap();

        transport.connect().unwrap();
        assert!(transport.is_connected());

        let (hello, client_addr) = recv_datagram(&broker);
        assert_eq!(hello.op, Op::Connect);
        assert_eq!(hello.payload, b"ecg-device-01");

        transport.subscribe("ecg/results").unwrap();
        let (sub, _) = recv_datagram(&broker);
        assert_eq!(sub.op, Op::Subscribe);
        assert_eq!(sub.topic, "ecg/results");

        transport.publish("ecg/data", b"{\"k\":1}").unwrap();
        let (publish, _) = recv_datagram(&broker);
        assert_eq!(publish.op, Op::Publish);
        assert_eq!(publish.topic, "ecg/data");
        assert_eq!(publish.payload, b"{\"k\":1}");

        // 服务端下发结果
        let reply = datagram::encode(Op::Publish, "ecg/results", b"normal").unwrap();
        broker.send_to(&reply, client_addr).unwrap();

        let mut received = Vec::new();
        for _ in 0..100 {
            transport
                .poll(&mut |topic: &str, payload: &[u8]| {
                    received.push((topic.to_string(), payload.to_vec()))
                })
                .unwrap();
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received, vec![("ecg/results".to_string(), b"normal".to_vec())]);
    }

    #[test]
    fn test_broker_restart_marks_disconnected_and_reconnect_delivers() {
        let (broker, url) = broker();
        let broker_addr = broker.local_addr().unwrap();
        let mut transport = UdpTransport::new(&url, "ecg-device-01").unwrap();
        transport.connect().unwrap();
        recv_datagram(&broker);

        // 代理下线：发往关闭端口的数据报引发ICMP端口不可达
        drop(broker);
        transport.publish("ecg/data", b"{}").unwrap();

        let mut delivered = 0;
        for _ in 0..100 {
            delivered += transport.poll(&mut |_: &str, _: &[u8]| {}).unwrap();
            if !transport.is_connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!transport.is_connected());
        assert_eq!(delivered, 0);

        // 代理在同一端口恢复，重连后结果可以送达
        let broker = StdUdpSocket::bind(broker_addr).unwrap();
        broker.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        transport.connect().unwrap();
        let (hello, client_addr) = recv_datagram(&broker);
        assert_eq!(hello.op, Op::Connect);

        let reply = datagram::encode(Op::Publish, "ecg/results", b"normal").unwrap();
        broker.send_to(&reply, client_addr).unwrap();
        broker.send_to(&reply, client_addr).unwrap();

        let mut received = 0;
        for _ in 0..100 {
            received += transport.poll(&mut |_: &str, _: &[u8]| {}).unwrap();
            if received == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received, 2);
        assert!(transport.is_connected());
    }
}
