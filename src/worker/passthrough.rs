//! Reference worker: forwards every message from `<m>in` to `<m>out`.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ModuleQueue;
use crate::error::BrokerError;
use crate::shutdown;

/// Progress is logged every this many messages.
const PROGRESS_EVERY: u64 = 100;

/// Runs the pass-through loop until shutdown. Returns the number of
/// messages forwarded.
pub async fn run_passthrough(
    queue: &ModuleQueue,
    idle: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<u64, BrokerError> {
    info!(
        module = %queue.module(),
        runtime_id = %queue.runtime_id(),
        "Worker started"
    );

    let mut processed = 0u64;
    loop {
        if shutdown::requested(&mut shutdown_rx) {
            break;
        }

        match queue.receive().await? {
            Some(message) => {
                queue.send(&message).await?;
                processed += 1;
                if processed % PROGRESS_EVERY == 0 && tracing::enabled!(tracing::Level::INFO) {
                    let remaining = queue.count_queued().await?;
                    info!(
                        module = %queue.module(),
                        runtime_id = %queue.runtime_id(),
                        processed,
                        remaining,
                        "Worker progress"
                    );
                }
            }
            None => {
                debug!(module = %queue.module(), "Empty queue, waiting");
                tokio::select! {
                    _ = shutdown::wait(&mut shutdown_rx) => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }

    info!(
        module = %queue.module(),
        runtime_id = %queue.runtime_id(),
        processed,
        "Worker stopped"
    );
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_forwards_until_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..3 {
            broker
                .sadd("Entryin", &format!(r#"{{"n": {}}}"#, i))
                .await
                .unwrap();
        }
        let queue = ModuleQueue::new("Entry_0", broker.clone()).expect("valid id");
        let (tx, rx) = shutdown::channel();

        let handle =
            tokio::spawn(async move { run_passthrough(&queue, Duration::from_millis(10), rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).expect("worker listening");

        let processed = handle.await.expect("worker joined").unwrap();
        assert_eq!(processed, 3);
        assert_eq!(broker.scard("Entryin").await.unwrap(), 0);
        assert_eq!(broker.scard("Entryout").await.unwrap(), 3);
    }
}
