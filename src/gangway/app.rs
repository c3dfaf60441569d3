use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::gangway::relay::{accept, channel::Channel, dispatch};
use crate::gangway::{config, logging, transport};

pub async fn run(overrides: config::Overrides) -> anyhow::Result<()> {
    let cfg = config::load(&overrides)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        listen = %cfg.listen,
        connect = %cfg.connect,
        via = cfg.connect_via.as_deref().unwrap_or(""),
        "gangway: starting"
    );

    let client = transport::client_for(&cfg)?;
    let server = transport::server_for(&cfg)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Capacity 1: an unclaimed inbound channel stalls the accept loop, which
    // is the intended ingestion bound.
    let (queue_tx, queue_rx) = mpsc::channel::<Channel>(1);

    let mut tasks = JoinSet::new();
    tasks.spawn(accept::run(server, queue_tx, shutdown_rx.clone()));
    {
        let client = client.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            dispatch::run(queue_rx, client, shutdown).await;
            Ok(())
        });
    }

    // Wait for a termination request. A loop finishing cleanly (e.g. the
    // accept loop after an accept failure) leaves everything else running;
    // a loop failing is fatal.
    let result = loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown: signal");
                break Ok(());
            }
            res = tasks.join_next() => match res {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => break Err(err),
                Some(Err(join_err)) => break Err(join_err.into()),
                None => break Ok(()),
            },
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(err) = client.close().await {
        tracing::debug!(err = %err, "gangway: client close failed");
    }

    // Drain every outstanding task. The accept loop closes the server as it
    // observes shutdown, and sessions close their channel pairs, so this
    // terminates without a deadline.
    while tasks.join_next().await.is_some() {}
    tracing::info!("gangway: all tasks drained");

    result
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform; unix also honors hangup/terminate/quit.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = hangup.recv() => {}
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
