//! Worker process side of the supervisor protocol
//!
//! A worker drains when the primary sends `Drain`, when it receives its own
//! SIGINT/SIGTERM, or when its control channel closes (the primary is gone).
//! `Shutdown` abandons in-flight requests.
//!
//! Stdin is read on a detached OS thread rather than through
//! `tokio::io::stdin`, whose blocking read would keep the runtime from
//! shutting down after the drain completes.

use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{termination_signal, ControlMessage};
use crate::context::ServiceContext;
use crate::error::Result;
use crate::proxy::server::{DrainOutcome, EdgeServer};

/// Serve until told to stop; returns how the drain ended
pub async fn run(ctx: Arc<ServiceContext>) -> Result<DrainOutcome> {
    let background = CancellationToken::new();
    ctx.start_background(background.clone()).await;

    let server = EdgeServer::bind(ctx.clone())?;
    let drain = CancellationToken::new();
    let abort = CancellationToken::new();

    tokio::spawn(watch_control(stdin_lines()?, drain.clone(), abort.clone()));
    {
        let drain = drain.clone();
        tokio::spawn(async move {
            termination_signal().await;
            tracing::info!("Termination signal received");
            drain.cancel();
        });
    }

    let outcome = tokio::select! {
        outcome = server.serve(drain) => outcome?,
        _ = abort.cancelled() => {
            tracing::warn!(worker = ?ctx.worker, "Shutdown requested, abandoning in-flight requests");
            DrainOutcome::TimedOut
        }
    };

    ctx.persist_stats().await;
    background.cancel();
    tracing::info!(worker = ?ctx.worker, ?outcome, "Worker exiting");
    Ok(outcome)
}

/// Lines of this process's stdin, read on a detached thread.
///
/// The channel closes on EOF or a read error. The thread is never joined,
/// so a pending read does not hold the process open.
pub fn stdin_lines() -> Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("control-reader".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Control channel read failed");
                        return;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Apply control messages, one JSON document per line.
///
/// Keeps listening after `Drain` so a later `Shutdown` can still abort the
/// drain; returns on `Shutdown` or when the channel closes.
pub async fn watch_control(
    mut lines: mpsc::UnboundedReceiver<String>,
    drain: CancellationToken,
    abort: CancellationToken,
) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlMessage>(line.trim()) {
            Ok(ControlMessage::Drain) => {
                tracing::info!("Drain requested by primary");
                drain.cancel();
            }
            Ok(ControlMessage::Shutdown) => {
                abort.cancel();
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed control message"),
        }
    }

    if !drain.is_cancelled() {
        tracing::warn!("Control channel closed, draining");
        drain.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn channel(lines: &[&str]) -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            tx.send(line.to_string()).unwrap();
        }
        (tx, rx)
    }

    #[tokio::test]
    async fn test_drain_message() {
        let (drain, abort) = (CancellationToken::new(), CancellationToken::new());
        // Sender stays open: the drain must come from the message itself
        let (tx, rx) = channel(&["", "not json", r#"{"type":"drain"}"#]);
        let watcher = tokio::spawn(watch_control(rx, drain.clone(), abort.clone()));

        tokio::time::timeout(Duration::from_secs(1), drain.cancelled())
            .await
            .expect("drain not signalled");
        assert!(!abort.is_cancelled());

        // Shutdown still reaches a draining worker
        tx.send(r#"{"type":"shutdown"}"#.to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_message_aborts() {
        let (drain, abort) = (CancellationToken::new(), CancellationToken::new());
        let (_tx, rx) = channel(&[r#"{"type":"shutdown"}"#]);
        watch_control(rx, drain.clone(), abort.clone()).await;
        assert!(abort.is_cancelled());
        assert!(!drain.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_channel_drains() {
        let (drain, abort) = (CancellationToken::new(), CancellationToken::new());
        let (tx, rx) = channel(&[]);
        drop(tx);
        watch_control(rx, drain.clone(), abort).await;
        assert!(drain.is_cancelled());
    }
}
