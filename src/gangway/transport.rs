use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::gangway::config::{Config, Scheme};
use crate::gangway::relay::channel::Channel;

/// Listening side of a transport backend.
#[async_trait]
pub trait TransportServer: Send {
    fn scheme(&self) -> &'static str;

    /// Bind the listening resource. Called once before accepting; servers
    /// constructed around an already-bound listener treat this as done.
    async fn listen(&mut self) -> anyhow::Result<()>;

    /// Perform one accept and push the resulting channel into the shared
    /// queue. The send is the ingestion backpressure point: with no free
    /// queue slot the accept loop stalls.
    async fn accept(&mut self, queue: &mpsc::Sender<Channel>) -> anyhow::Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Release the listening resource.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Dialing side of a transport backend. One outbound channel per `connect`.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn connect(&self) -> anyhow::Result<Channel>;

    /// Best-effort top-level cleanup at process shutdown, not per-session.
    async fn close(&self) -> anyhow::Result<()>;
}

pub mod ssh;
pub mod tcp;

pub fn server_for(cfg: &Config) -> anyhow::Result<Box<dyn TransportServer>> {
    match cfg.listen.scheme {
        Scheme::Tcp => Ok(Box::new(tcp::TcpTransportServer::new(&cfg.listen.addr))),
        Scheme::Ssh => {
            let hostkey = cfg
                .hostkey
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("ssh: listen endpoint requires a host key"))?;
            Ok(Box::new(ssh::SshTransportServer::new(
                &cfg.listen.addr,
                hostkey,
            )?))
        }
    }
}

pub fn client_for(cfg: &Config) -> anyhow::Result<Arc<dyn TransportClient>> {
    match cfg.connect.scheme {
        Scheme::Tcp => Ok(Arc::new(tcp::TcpTransportClient::new(&cfg.connect.addr))),
        Scheme::Ssh => Ok(Arc::new(ssh::SshTransportClient::new(
            &cfg.connect,
            cfg.connect_via.as_deref(),
        ))),
    }
}
