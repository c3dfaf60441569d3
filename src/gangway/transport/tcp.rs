use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::gangway::relay::channel::{Channel, HalfClose};
use crate::gangway::transport::{TransportClient, TransportServer};

pub struct TcpTransportServer {
    addr: String,
    listener: Option<TcpListener>,
}

impl TcpTransportServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            listener: None,
        }
    }

    /// Wrap an already-bound listener (ephemeral ports in tests).
    pub fn from_listener(listener: TcpListener) -> Self {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self {
            addr,
            listener: Some(listener),
        }
    }
}

#[async_trait]
impl TransportServer for TcpTransportServer {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&mut self) -> anyhow::Result<()> {
        if self.listener.is_none() {
            let ln = TcpListener::bind(&self.addr)
                .await
                .with_context(|| format!("tcp: bind {}", self.addr))?;
            self.listener = Some(ln);
        }
        Ok(())
    }

    async fn accept(&mut self, queue: &mpsc::Sender<Channel>) -> anyhow::Result<()> {
        let ln = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("tcp: accept before listen"))?;
        let (stream, peer) = ln.accept().await.context("tcp: accept")?;
        tracing::debug!(peer = %peer, "tcp: connection accepted");

        let ch = Channel::new(Box::new(stream), HalfClose::Supported, peer.to_string());
        queue
            .send(ch)
            .await
            .map_err(|_| anyhow::anyhow!("tcp: relay queue closed"))?;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        // Dropping the listener releases the socket.
        self.listener.take();
        Ok(())
    }
}

pub struct TcpTransportClient {
    addr: String,
}

impl TcpTransportClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl TransportClient for TcpTransportClient {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self) -> anyhow::Result<Channel> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("tcp: connect {}", self.addr))?;
        tracing::debug!(remote = %self.addr, "tcp: connected");
        Ok(Channel::new(
            Box::new(stream),
            HalfClose::Supported,
            self.addr.clone(),
        ))
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Connections are per-session; nothing is held at the top level.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gangway::relay::{accept, dispatch};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::watch;

    #[tokio::test]
    async fn close_releases_the_listener() {
        let mut server = TcpTransportServer::new("127.0.0.1:0");
        server.listen().await.unwrap();
        assert!(server.local_addr().is_some());
        server.close().await.unwrap();
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn relays_tcp_to_tcp_end_to_end() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = ln.local_addr().unwrap();
        let server = TcpTransportServer::from_listener(ln);
        let client = Arc::new(TcpTransportClient::new(backend_addr.to_string()));

        let (queue_tx, queue_rx) = tokio::sync::mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept::run(
            Box::new(server),
            queue_tx,
            shutdown_rx.clone(),
        ));
        let dispatch_task = tokio::spawn(dispatch::run(queue_rx, client, shutdown_rx));

        let mut cli = TcpStream::connect(relay_addr).await.unwrap();
        let (mut upstream, _) = backend.accept().await.unwrap();

        cli.write_all(b"GET /\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /\r\n");

        upstream.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
        let mut buf = [0u8; 17];
        cli.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.0 200 OK\r\n");

        // Backend EOF propagates to the inbound side as closure.
        drop(upstream);
        let mut rest = Vec::new();
        cli.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        shutdown_tx.send(true).unwrap();
        accept_task.await.unwrap().unwrap();
        dispatch_task.await.unwrap();
    }
}
