// SIP transports: UDP datagrams and content-length framed TCP

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Error, Result, SipMessage, SipParser};

/// Transports deliver parsed messages to one of these.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        message: SipMessage,
        source: SocketAddr,
        transport: Arc<dyn Transport>,
    );
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &SipMessage, target: SocketAddr) -> Result<()>;
    async fn stop(&self);
    fn local_addr(&self) -> SocketAddr;
    fn protocol(&self) -> &'static str;

    /// Retransmissions are only needed on unreliable transports.
    fn is_reliable(&self) -> bool {
        self.protocol() != "UDP"
    }
}

// UDP Transport
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub async fn bind(local_addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|e| Error::Transport(format!("UDP bind {}: {}", local_addr, e)))?;
        let actual = socket
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(addr = %actual, "UDP transport bound");

        Ok(Arc::new(UdpTransport {
            socket: Arc::new(socket),
            local_addr: actual,
            reader: Mutex::new(None),
        }))
    }

    /// Spawn the datagram reader feeding `handler`.
    pub async fn start(self: Arc<Self>, handler: Arc<dyn MessageHandler>) {
        let transport = self.clone();
        let socket = self.socket.clone();
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; 65_535];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((size, source)) => {
                        // Keep-alive CRLF padding between requests
                        let data = &buffer[..size];
                        if data.iter().all(|&b| b == b'\r' || b == b'\n') {
                            continue;
                        }
                        match SipParser::parse(data) {
                            Ok((message, _)) => {
                                handler
                                    .handle_message(
                                        message,
                                        source,
                                        transport.clone() as Arc<dyn Transport>,
                                    )
                                    .await;
                            }
                            Err(e) => {
                                debug!(%source, error = %e, "dropping unparseable datagram");
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "UDP receive failed");
                        break;
                    }
                }
            }
        });
        *self.reader.lock().await = Some(task);
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &SipMessage, target: SocketAddr) -> Result<()> {
        let data = message.to_bytes();
        self.socket
            .send_to(&data, target)
            .await
            .map_err(|e| Error::Transport(format!("UDP send to {}: {}", target, e)))?;
        debug!(bytes = data.len(), %target, "sent");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        info!(addr = %self.local_addr, "UDP transport stopped");
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn protocol(&self) -> &'static str {
        "UDP"
    }
}

// TCP Transport: one reader task per connection, responses reuse the
// connection that carried the request.
pub struct TcpTransport {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    connections: Arc<RwLock<HashMap<SocketAddr, Arc<Mutex<OwnedWriteHalf>>>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub async fn bind(local_addr: SocketAddr) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(local_addr)
            .await
            .map_err(|e| Error::Transport(format!("TCP bind {}: {}", local_addr, e)))?;
        let actual = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;
        info!(addr = %actual, "TCP transport bound");

        let transport = Arc::new(TcpTransport {
            local_addr: actual,
            listener: Mutex::new(Some(listener)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            acceptor: Mutex::new(None),
        });
        Ok(transport)
    }

    pub async fn start(self: Arc<Self>, handler: Arc<dyn MessageHandler>) {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .expect("start called once after bind");
        let transport = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "TCP connection accepted");
                        transport.clone().adopt(stream, peer, handler.clone()).await;
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                        break;
                    }
                }
            }
        });
        *self.acceptor.lock().await = Some(task);
    }

    async fn adopt(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) {
        let (mut read_half, write_half) = stream.into_split();
        self.connections
            .write()
            .await
            .insert(peer, Arc::new(Mutex::new(write_half)));

        let transport = self.clone();
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::with_capacity(4096);
            let mut chunk = [0u8; 4096];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        // Drain every complete message in the buffer
                        loop {
                            // Leading keep-alive CRLFs between messages
                            let skip = buffer
                                .iter()
                                .take_while(|&&b| b == b'\r' || b == b'\n')
                                .count();
                            if skip > 0 {
                                buffer.drain(..skip);
                            }
                            if buffer.is_empty() {
                                break;
                            }
                            match SipParser::try_parse(&buffer) {
                                Ok(Some((message, consumed))) => {
                                    buffer.drain(..consumed);
                                    handler
                                        .handle_message(
                                            message,
                                            peer,
                                            transport.clone() as Arc<dyn Transport>,
                                        )
                                        .await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(%peer, error = %e, "closing TCP connection on parse error");
                                    transport.connections.write().await.remove(&peer);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "TCP read ended");
                        break;
                    }
                }
            }
            transport.connections.write().await.remove(&peer);
        });
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: &SipMessage, target: SocketAddr) -> Result<()> {
        let data = message.to_bytes();

        if let Some(conn) = self.connections.read().await.get(&target).cloned() {
            conn.lock()
                .await
                .write_all(&data)
                .await
                .map_err(|e| Error::Transport(format!("TCP send to {}: {}", target, e)))?;
            return Ok(());
        }

        // No established connection: open one just for this send
        let mut stream = TcpStream::connect(target)
            .await
            .map_err(|e| Error::Transport(format!("TCP connect {}: {}", target, e)))?;
        stream
            .write_all(&data)
            .await
            .map_err(|e| Error::Transport(format!("TCP send to {}: {}", target, e)))?;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.acceptor.lock().await.take() {
            task.abort();
        }
        self.connections.write().await.clear();
        info!(addr = %self.local_addr, "TCP transport stopped");
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn protocol(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SipMethod, SipUri};
    use tokio::sync::mpsc;

    struct ChannelHandler(mpsc::Sender<(SipMessage, SocketAddr)>);

    #[async_trait]
    impl MessageHandler for ChannelHandler {
        async fn handle_message(
            &self,
            message: SipMessage,
            source: SocketAddr,
            _transport: Arc<dyn Transport>,
        ) {
            let _ = self.0.send((message, source)).await;
        }
    }

    fn options_message() -> SipMessage {
        let mut msg =
            SipMessage::new_request(SipMethod::Options, SipUri::parse("sip:test@dest").unwrap());
        msg.headers.set(
            crate::HeaderName::new(crate::HeaderName::CSEQ),
            "1 OPTIONS".to_string(),
        );
        msg.headers.set(
            crate::HeaderName::new(crate::HeaderName::CALL_ID),
            "transport-test".to_string(),
        );
        msg.headers.set(
            crate::HeaderName::new(crate::HeaderName::CONTENT_LENGTH),
            "0".to_string(),
        );
        msg
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let (tx, mut rx) = mpsc::channel(4);
        let receiver = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        receiver.clone().start(Arc::new(ChannelHandler(tx))).await;

        let sender = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        sender
            .send(&options_message(), receiver.local_addr())
            .await
            .unwrap();

        let (msg, source) = rx.recv().await.unwrap();
        assert_eq!(msg.method(), Some(SipMethod::Options));
        assert_eq!(source, sender.local_addr());

        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_udp_ignores_garbage() {
        let (tx, mut rx) = mpsc::channel(4);
        let receiver = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        receiver.clone().start(Arc::new(ChannelHandler(tx))).await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"\r\n\r\n", receiver.local_addr()).await.unwrap();
        raw.send_to(b"complete garbage", receiver.local_addr())
            .await
            .unwrap();

        // Then a valid message still gets through
        let sender = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        sender
            .send(&options_message(), receiver.local_addr())
            .await
            .unwrap();

        let (msg, _) = rx.recv().await.unwrap();
        assert_eq!(msg.get_call_id().unwrap(), "transport-test");
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_tcp_framing_across_segments() {
        let (tx, mut rx) = mpsc::channel(4);
        let server = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        server.clone().start(Arc::new(ChannelHandler(tx))).await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let bytes = options_message().to_bytes();

        // Deliver the message in two arbitrary segments
        let (a, b) = bytes.split_at(25);
        client.write_all(a).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.write_all(b).await.unwrap();

        let (msg, _) = rx.recv().await.unwrap();
        assert_eq!(msg.method(), Some(SipMethod::Options));

        // Two messages back to back in one write
        let mut double = options_message().to_bytes();
        double.extend(options_message().to_bytes());
        client.write_all(&double).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        server.stop().await;
    }
}
