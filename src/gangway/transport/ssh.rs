use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::Context;
use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::{ChannelId, ChannelStream, Pty, client, keys};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::gangway::config::Endpoint;
use crate::gangway::relay::channel::{Channel, HalfClose};
use crate::gangway::transport::{TransportClient, TransportServer};

/// Used when the connect URL carries no password. Deliberately insecure and
/// loudly flagged at startup; it mirrors the fixed fallback operators expect
/// from the classic ssh2tcp tooling.
pub const INSECURE_FALLBACK_PASSWORD: &str = "12345678";

/// SSH listener: accepts TCP connections, runs the SSH handshake off the
/// accept path, and queues one relay channel per SSH session channel the
/// remote opens.
#[derive(Debug)]
pub struct SshTransportServer {
    addr: String,
    config: Arc<russh::server::Config>,
    listener: Option<TcpListener>,
}

impl SshTransportServer {
    /// The host key is loaded from `hostkey`; an unreadable or unparseable
    /// key is fatal here, before any relay starts.
    pub fn new(addr: impl Into<String>, hostkey: &Path) -> anyhow::Result<Self> {
        let key = keys::load_secret_key(hostkey, None)
            .with_context(|| format!("ssh: load host key {}", hostkey.display()))?;
        Ok(Self::with_key(addr, key))
    }

    /// Build with an in-memory host key (ephemeral listeners, tests).
    pub fn with_key(addr: impl Into<String>, key: keys::PrivateKey) -> Self {
        let config = russh::server::Config {
            keys: vec![key],
            ..Default::default()
        };
        Self {
            addr: addr.into(),
            config: Arc::new(config),
            listener: None,
        }
    }
}

#[async_trait]
impl TransportServer for SshTransportServer {
    fn scheme(&self) -> &'static str {
        "ssh"
    }

    async fn listen(&mut self) -> anyhow::Result<()> {
        if self.listener.is_none() {
            let ln = TcpListener::bind(&self.addr)
                .await
                .with_context(|| format!("ssh: bind {}", self.addr))?;
            self.listener = Some(ln);
        }
        Ok(())
    }

    async fn accept(&mut self, queue: &mpsc::Sender<Channel>) -> anyhow::Result<()> {
        let ln = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ssh: accept before listen"))?;
        let (socket, peer) = ln.accept().await.context("ssh: accept")?;
        tracing::debug!(peer = %peer, "ssh: connection accepted; starting handshake");

        let config = self.config.clone();
        let handler = SshServerHandler {
            queue: queue.clone(),
            peer: peer.to_string(),
        };
        // The handshake and connection pump run detached, like the rest of the
        // SSH connection's lifetime; its session channels reach the relay
        // through the queue captured by the handler.
        tokio::spawn(async move {
            match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => {
                    if let Err(err) = session.await {
                        tracing::debug!(peer = %peer, err = %err, "ssh: connection ended with error");
                    }
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, err = %err, "ssh: handshake failed");
                }
            }
        });
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.listener.take();
        Ok(())
    }
}

struct SshServerHandler {
    queue: mpsc::Sender<Channel>,
    peer: String,
}

impl russh::server::Handler for SshServerHandler {
    type Error = russh::Error;

    // Open authentication: any presented credential is accepted.
    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(peer = %self.peer, user, "ssh: accepting password auth");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer, "ssh: session channel opened");
        let ch = Channel::new(
            Box::new(channel.into_stream()),
            HalfClose::Unsupported,
            self.peer.clone(),
        );
        // Blocking on a full queue is the ingestion backpressure point.
        if self.queue.send(ch).await.is_err() {
            tracing::debug!(peer = %self.peer, "ssh: relay queue closed; refusing channel");
            return Ok(false);
        }
        Ok(true)
    }

    // exec/shell/pty/window-change are acknowledged without interpretation;
    // only the byte-stream channel matters to the relay.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }
}

/// SSH dialer: one fresh SSH connection, session channel and remote shell per
/// `connect` call.
pub struct SshTransportClient {
    addr: String,
    user: String,
    password: String,
    config: Arc<client::Config>,
}

impl SshTransportClient {
    pub fn new(endpoint: &Endpoint, connect_via: Option<&str>) -> Self {
        let (addr, user) = match connect_via {
            // Gateway routing: dial the gateway on its SSH port and carry the
            // real destination in the username.
            Some(via) => (
                format!("{via}:22"),
                format!("{}@{}", endpoint.user, endpoint.addr),
            ),
            None => (endpoint.addr.clone(), endpoint.user.clone()),
        };

        let password = match &endpoint.password {
            Some(p) => p.clone(),
            None => {
                tracing::warn!(
                    "ssh: no password in connect endpoint; using the insecure built-in default"
                );
                INSECURE_FALLBACK_PASSWORD.to_string()
            }
        };
        tracing::warn!(addr = %addr, "ssh: outbound host keys are not verified");

        Self {
            addr,
            user,
            password,
            config: Arc::new(client::Config::default()),
        }
    }
}

#[async_trait]
impl TransportClient for SshTransportClient {
    fn scheme(&self) -> &'static str {
        "ssh"
    }

    async fn connect(&self) -> anyhow::Result<Channel> {
        let socket_addr = self
            .addr
            .to_socket_addrs()
            .with_context(|| format!("ssh: resolve {}", self.addr))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("ssh: {} resolved to no address", self.addr))?;

        tracing::debug!(addr = %self.addr, "ssh: dialing");
        let mut handle = client::connect(self.config.clone(), socket_addr, InsecureHostKeys)
            .await
            .with_context(|| format!("ssh: connect {}", self.addr))?;

        let auth = handle
            .authenticate_password(&self.user, &self.password)
            .await
            .context("ssh: password authentication")?;
        if !auth.success() {
            anyhow::bail!("ssh: password authentication rejected for {:?}", self.user);
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .context("ssh: open session channel")?;
        channel
            .request_shell(false)
            .await
            .context("ssh: shell request")?;

        let stream = SshClientStream {
            stream: channel.into_stream(),
            _handle: handle,
        };
        Ok(Channel::new(
            Box::new(stream),
            HalfClose::Unsupported,
            self.addr.clone(),
        ))
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Each connect() owns its connection through the returned channel;
        // there is no top-level state to release.
        Ok(())
    }
}

/// No host key verification, as the contract demands. The warning happens
/// once, at client construction.
#[derive(Debug, Clone)]
struct InsecureHostKeys;

impl client::Handler for InsecureHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// The channel's byte stream bundled with the connection handle, so the SSH
/// connection lives exactly as long as the relay channel that claimed it.
struct SshClientStream {
    stream: ChannelStream<client::Msg>,
    _handle: client::Handle<InsecureHostKeys>,
}

impl AsyncRead for SshClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gangway::config;
    use crate::gangway::relay::{accept, dispatch};
    use crate::gangway::transport::tcp::TcpTransportClient;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::watch;

    #[test]
    fn missing_host_key_is_fatal() {
        let err = SshTransportServer::new("127.0.0.1:0", Path::new("/nonexistent/hostkey"))
            .unwrap_err();
        assert!(err.to_string().contains("host key"));
    }

    fn test_hostkey() -> keys::PrivateKey {
        keys::PrivateKey::random(
            &mut keys::ssh_key::rand_core::OsRng,
            keys::ssh_key::Algorithm::Ed25519,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn relays_ssh_to_tcp_end_to_end() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = ln.local_addr().unwrap();
        let mut server = SshTransportServer::with_key(relay_addr.to_string(), test_hostkey());
        server.listener = Some(ln);

        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept::run(
            Box::new(server),
            queue_tx,
            shutdown_rx.clone(),
        ));
        let client = Arc::new(TcpTransportClient::new(backend_addr.to_string()));
        let dispatch_task = tokio::spawn(dispatch::run(queue_rx, client, shutdown_rx));

        // Drive the listener with gangway's own SSH dialer.
        let ep = config::parse_endpoint(&format!("ssh://tester:pw@{relay_addr}")).unwrap();
        let inbound = SshTransportClient::new(&ep, None).connect().await.unwrap();
        assert_eq!(inbound.half_close(), HalfClose::Unsupported);

        let (mut upstream, _) = backend.accept().await.unwrap();
        let (mut rd, mut wr) = inbound.split();

        wr.write_all(b"GET /\r\n").await.unwrap();
        wr.flush().await.unwrap();
        let mut buf = [0u8; 7];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /\r\n");

        upstream.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        // Backend EOF tears the session down; the SSH side observes closure.
        drop(upstream);
        let n = rd.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);

        shutdown_tx.send(true).unwrap();
        accept_task.await.unwrap().unwrap();
        dispatch_task.await.unwrap();
    }
}
