use std::sync::Arc;

use tokio::{sync::watch, task::JoinSet};

use crate::gangway::relay::channel::{Channel, ChannelReader, ChannelWriter, CloseOnce, HalfClose};
use crate::gangway::transport::TransportClient;

/// One relay session: dial an outbound channel, splice bytes both ways, tear
/// both channels down exactly once.
///
/// A failed dial is local to this session: the inbound channel is closed and
/// nothing else is affected (no retry).
pub async fn run(
    inbound: Channel,
    client: Arc<dyn TransportClient>,
    shutdown: watch::Receiver<bool>,
) {
    let peer = inbound.peer().to_string();

    let outbound = match client.connect().await {
        Ok(ch) => ch,
        Err(err) => {
            tracing::warn!(peer = %peer, err = %err, "relay: outbound dial failed; dropping inbound channel");
            if let Err(err) = inbound.close().await {
                tracing::debug!(peer = %peer, err = %err, "relay: inbound close failed");
            }
            return;
        }
    };

    tracing::debug!(peer = %peer, outbound = %outbound.peer(), "relay: session established");
    splice(inbound, outbound, shutdown).await;
    tracing::debug!(peer = %peer, "relay: session closed");
}

/// Copy bytes in both directions until one side terminates, then close both
/// channels. Whichever copy finishes first fires the close-once guard, which
/// cancels the opposite copy; closure, not cooperative cancellation, is what
/// unblocks a pending read or write. Global shutdown fires the same guard.
async fn splice(inbound: Channel, outbound: Channel, mut shutdown: watch::Receiver<bool>) {
    let guard = CloseOnce::new();
    let (in_rd, in_wr) = inbound.split();
    let (out_rd, out_wr) = outbound.split();

    let mut copies = JoinSet::new();
    copies.spawn(copy_until_closed("inbound->outbound", in_rd, out_wr, guard.clone()));
    copies.spawn(copy_until_closed("outbound->inbound", out_rd, in_wr, guard.clone()));

    // Supervisory watcher: a termination request tears down an in-flight
    // splice. Aborted once both copies are done, so a finished session
    // releases its task slot without waiting for process shutdown.
    let watcher = {
        let guard = guard.clone();
        tokio::spawn(async move {
            if shutdown.wait_for(|stop| *stop).await.is_ok() {
                guard.fire();
            }
        })
    };

    while copies.join_next().await.is_some() {}
    watcher.abort();
    let _ = watcher.await;
}

async fn copy_until_closed(
    direction: &'static str,
    mut rd: ChannelReader,
    mut wr: ChannelWriter,
    guard: CloseOnce,
) {
    tokio::select! {
        res = tokio::io::copy(&mut rd, &mut wr) => match res {
            Ok(bytes) => tracing::debug!(direction, bytes, "relay: stream ended"),
            // Resets and broken pipes are ordinary teardown, not failures.
            Err(err) => tracing::debug!(direction, err = %err, "relay: stream ended"),
        },
        _ = guard.closed() => {}
    }

    if wr.half_close() == HalfClose::Unsupported {
        tracing::debug!(direction, "relay: transport lacks half-close; closing whole channel");
    }
    let _ = wr.close_write().await;

    if guard.fire() {
        tracing::debug!(direction, "relay: closing channel pair");
    }
    // Dropping the halves releases the underlying connections.
}
