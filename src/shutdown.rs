//! Termination signals and the in-process shutdown broadcast.
//!
//! Long-running loops hold a `broadcast::Receiver<()>` and check it at each
//! iteration boundary; `main` fires the sender when a signal arrives.

use tokio::sync::broadcast;

/// Creates the shutdown channel. Buffer size of 1 is enough for one signal.
pub fn channel() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
    broadcast::channel(1)
}

/// Non-blocking check for a pending shutdown.
///
/// A closed channel counts as shutdown: the sender is gone.
pub fn requested(rx: &mut broadcast::Receiver<()>) -> bool {
    match rx.try_recv() {
        Ok(()) | Err(broadcast::error::TryRecvError::Closed) => true,
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
    }
}

/// Waits until shutdown is signalled through the channel.
pub async fn wait(rx: &mut broadcast::Receiver<()>) {
    // any outcome (message, lag, closed) means stop
    let _ = rx.recv().await;
}

/// Waits for SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_after_send() {
        let (tx, mut rx) = channel();
        assert!(!requested(&mut rx));
        tx.send(()).expect("receiver alive");
        assert!(requested(&mut rx));
    }

    #[test]
    fn test_requested_when_sender_dropped() {
        let (tx, mut rx) = channel();
        drop(tx);
        assert!(requested(&mut rx));
    }
}
