use anyhow::Context;
use tokio::sync::{mpsc, watch};

use crate::gangway::relay::channel::Channel;
use crate::gangway::transport::TransportServer;

/// Drives a transport server: listen once, then accept until the first accept
/// failure or shutdown.
///
/// A listen failure is a setup error and propagates (fatal). An accept failure
/// only ends ingestion: the loop stops permanently, existing sessions keep
/// running, and no restart is attempted.
pub async fn run(
    mut server: Box<dyn TransportServer>,
    queue: mpsc::Sender<Channel>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    server
        .listen()
        .await
        .with_context(|| format!("{}: listen", server.scheme()))?;
    tracing::info!(
        scheme = server.scheme(),
        addr = ?server.local_addr(),
        "relay: listening"
    );

    let shutdown_check = shutdown.clone();
    loop {
        tokio::select! {
            biased;
            // Dropping the in-flight accept here is the tokio analogue of the
            // listener close that unblocks a pending accept at shutdown.
            _ = shutdown.wait_for(|stop| *stop) => break,
            res = server.accept(&queue) => {
                if let Err(err) = res {
                    tracing::warn!(
                        scheme = server.scheme(),
                        err = %err,
                        "relay: accept failed; no further sessions will be admitted"
                    );
                    break;
                }
                // The signal is otherwise checked only between accepts.
                if *shutdown_check.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(err) = server.close().await {
        tracing::debug!(scheme = server.scheme(), err = %err, "relay: listener close failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gangway::relay::channel::HalfClose;
    use std::net::SocketAddr;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct ScriptedServer {
        listen_ok: bool,
        accepts_before_error: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TransportServer for ScriptedServer {
        fn scheme(&self) -> &'static str {
            "scripted"
        }

        async fn listen(&mut self) -> anyhow::Result<()> {
            if !self.listen_ok {
                anyhow::bail!("bind refused");
            }
            Ok(())
        }

        async fn accept(&mut self, queue: &mpsc::Sender<Channel>) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.accepts_before_error {
                anyhow::bail!("accept failed");
            }
            let (near, _far) = tokio::io::duplex(16);
            queue
                .send(Channel::new(Box::new(near), HalfClose::Supported, "scripted"))
                .await
                .map_err(|_| anyhow::anyhow!("queue closed"))?;
            Ok(())
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn accept_error_stops_the_loop_permanently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let server = ScriptedServer {
            listen_ok: true,
            accepts_before_error: 2,
            calls: calls.clone(),
        };
        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        run(Box::new(server), tx, shutdown_rx).await.unwrap();

        // Two accepted, the third errored, a fourth never happened.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn listen_failure_is_fatal() {
        let server = ScriptedServer {
            listen_ok: false,
            accepts_before_error: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let (tx, _rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = run(Box::new(server), tx, shutdown_rx).await.unwrap_err();
        assert!(err.to_string().contains("listen"));
    }

    #[tokio::test]
    async fn shutdown_already_set_accepts_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let server = ScriptedServer {
            listen_ok: true,
            accepts_before_error: usize::MAX,
            calls: calls.clone(),
        };
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        run(Box::new(server), tx, shutdown_rx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
