// SIP 传输层
// UDP 必选；TCP 可选，与 UDP 同端口，按 Content-Length 分帧

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use super::message::{frame_len, SipMessage, SipParseError};
use super::transaction::{Endpoint, SipEvent};
use crate::directory::Transport;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct SipTransport {
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    tcp_enabled: bool,
    tcp_links: Arc<DashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>,
    events: mpsc::UnboundedSender<SipEvent>,
    shutdown: watch::Receiver<bool>,
}

impl SipTransport {
    /// 绑定监听并启动接收循环；UDP 绑定失败返回错误，TCP 失败仅告警
    pub async fn bind(
        bind_ip: &str,
        port: u16,
        enable_tcp: bool,
        events: mpsc::UnboundedSender<SipEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Arc<Self>> {
        let udp = Arc::new(UdpSocket::bind((bind_ip, port)).await?);
        let local_addr = udp.local_addr()?;

        let listener = if enable_tcp {
            match TcpListener::bind(local_addr).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    tracing::warn!(target: "gb28181::sip", %local_addr, error = %e, "SIP TCP listen failed, UDP only");
                    None
                }
            }
        } else {
            None
        };

        let transport = Arc::new(Self {
            udp: udp.clone(),
            local_addr,
            tcp_enabled: listener.is_some(),
            tcp_links: Arc::new(DashMap::new()),
            events,
            shutdown,
        });

        tokio::spawn(transport.clone().udp_loop());
        if let Some(listener) = listener {
            tokio::spawn(transport.clone().accept_loop(listener));
        }

        tracing::info!(
            target: "gb28181::sip",
            %local_addr,
            tcp = transport.tcp_enabled,
            "GB28181 SIP transport listening"
        );
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 发送到指定对端；TCP 复用已有连接，没有则主动建连
    pub async fn send(&self, data: &[u8], target: &Endpoint) -> io::Result<()> {
        match target.transport {
            Transport::Udp => {
                self.udp.send_to(data, target.addr).await?;
                Ok(())
            }
            Transport::Tcp => {
                if let Some(link) = self.tcp_links.get(&target.addr) {
                    if link.send(data.to_vec()).is_ok() {
                        return Ok(());
                    }
                }
                let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(target.addr))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "SIP TCP connect timed out"))??;
                let link = self.spawn_connection(stream, target.addr);
                link.send(data.to_vec())
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "SIP TCP link closed"))
            }
        }
    }

    async fn udp_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; 65535];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = self.udp.recv_from(&mut buf) => match res {
                    Ok((n, peer)) => self.deliver(&buf[..n], Endpoint::udp(peer)),
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", error = %e, "SIP UDP recv failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        tracing::debug!(target: "gb28181::sip", "SIP UDP loop stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        tracing::debug!(target: "gb28181::sip", %peer, "SIP TCP connection accepted");
                        self.spawn_connection(stream, peer);
                    }
                    Err(e) => {
                        tracing::warn!(target: "gb28181::sip", error = %e, "SIP TCP accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.tcp_links.insert(peer, tx.clone());

        let (mut reader, mut writer) = stream.into_split();

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    tracing::warn!(target: "gb28181::sip", %peer, error = %e, "SIP TCP write failed");
                    break;
                }
            }
        });

        let links = self.tcp_links.clone();
        let events = self.events.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(8192);
            loop {
                let read = tokio::select! {
                    _ = shutdown.changed() => break,
                    read = reader.read_buf(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        // 心跳 CRLF
                        while buf.starts_with(b"\r\n") {
                            buf.advance(2);
                        }
                        if let Err(e) = drain_frames(&mut buf, &events, peer) {
                            tracing::warn!(target: "gb28181::sip", %peer, error = %e, "SIP TCP framing error, closing connection");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(target: "gb28181::sip", %peer, error = %e, "SIP TCP read failed");
                        break;
                    }
                }
            }
            links.remove(&peer);
        });

        tx
    }

    fn deliver(&self, data: &[u8], peer: Endpoint) {
        deliver_to(&self.events, data, peer);
    }
}

/// 从缓冲区切出所有完整的消息并投递
fn drain_frames(
    buf: &mut BytesMut,
    events: &mpsc::UnboundedSender<SipEvent>,
    peer: SocketAddr,
) -> std::result::Result<(), SipParseError> {
    while let Some(len) = frame_len(buf)? {
        let frame = buf.split_to(len);
        deliver_to(events, &frame, Endpoint::tcp(peer));
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }
    }
    Ok(())
}

fn deliver_to(events: &mpsc::UnboundedSender<SipEvent>, data: &[u8], peer: Endpoint) {
    let span = tracing::info_span!("gb28181.sip.handle_message", remote = %peer.addr, bytes = data.len());
    let _enter = span.enter();

    let text = String::from_utf8_lossy(data);
    if text.trim().is_empty() {
        return;
    }

    let event = match SipMessage::parse(&text) {
        Ok(SipMessage::Request(request)) => SipEvent::Request { request, peer },
        Ok(SipMessage::Response(response)) => SipEvent::Response { response, peer },
        Err(e) => {
            tracing::warn!(target: "gb28181::sip", error = %e, "Failed to parse SIP message");
            return;
        }
    };

    if events.send(event).is_err() {
        tracing::debug!(target: "gb28181::sip", "SIP event dispatcher stopped, dropping message");
    }
}

/// 将 span 附着到异步任务上
pub(crate) fn in_span<F: std::future::Future>(fut: F, remote: SocketAddr) -> tracing::instrument::Instrumented<F> {
    fut.instrument(tracing::info_span!("gb28181.sip.dispatch", remote = %remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_frames_keeps_partial_tail() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        let mut buf = BytesMut::from(
            &b"\r\nOPTIONS sip:a@b SIP/2.0\r\nCall-ID: 1@x\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n\r\nSIP/2.0 200"[..],
        );
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }

        drain_frames(&mut buf, &tx, peer).unwrap();
        assert!(matches!(rx.try_recv(), Ok(SipEvent::Request { .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(&buf[..], b"SIP/2.0 200");
    }

    #[tokio::test]
    async fn test_oversized_tcp_frame_closes_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop, shutdown) = watch::channel(false);
        let transport = SipTransport::bind("127.0.0.1", 0, true, tx, shutdown).await.unwrap();

        let mut stream = TcpStream::connect(transport.local_addr()).await.unwrap();
        stream
            .write_all(b"MESSAGE sip:a@b SIP/2.0\r\nCall-ID: 2@x\r\nCSeq: 2 MESSAGE\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        stream
            .write_all(b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 18446744073709551615\r\n\r\n")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SipEvent::Request { .. }));

        // 服务端断开：读到 EOF 或连接被重置
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
