use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};

use crate::gangway::relay::{channel::Channel, session};
use crate::gangway::transport::TransportClient;

/// Consumes enqueued inbound channels and spawns one relay session per
/// channel. Each queue item is claimed by exactly one session.
///
/// After the shutdown signal is set (or the queue closes) nothing further is
/// dequeued, but sessions already spawned keep running; they are drained
/// before this returns so the orchestrator's wait covers them.
pub async fn run(
    mut queue: mpsc::Receiver<Channel>,
    client: Arc<dyn TransportClient>,
    shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    let mut stop = shutdown.clone();

    loop {
        tokio::select! {
            // Checked first so a set signal always wins over a ready queue item.
            biased;
            _ = stop.wait_for(|stop| *stop) => break,
            inbound = queue.recv() => match inbound {
                Some(inbound) => {
                    tracing::debug!(peer = %inbound.peer(), "relay: inbound channel claimed");
                    sessions.spawn(session::run(inbound, client.clone(), shutdown.clone()));
                }
                None => break,
            },
        }
    }

    queue.close();
    let active = sessions.len();
    if active > 0 {
        tracing::debug!(active, "relay: dispatcher draining sessions");
    }
    while sessions.join_next().await.is_some() {}
}
