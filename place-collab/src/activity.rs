//! Periodic live-viewer count for a namespace.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broadcast::BroadcastBus;
use crate::protocol::{BroadcastEvent, ProtocolError};

/// Publish one `activity` event carrying the current viewer count.
pub async fn broadcast_activity(bus: &BroadcastBus, namespace: &str) -> Result<usize, ProtocolError> {
    let count = bus.subscriber_count(namespace).await;
    bus.publish(namespace, &BroadcastEvent::activity(count)).await?;
    Ok(count)
}

/// Publish activity every `period` until the task is aborted.
pub fn spawn(bus: Arc<BroadcastBus>, namespace: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match broadcast_activity(&bus, &namespace).await {
                Ok(count) => log::trace!("{count} viewers on {namespace}"),
                Err(e) => log::warn!("activity broadcast on {namespace} failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Subscriber;

    #[tokio::test]
    async fn test_activity_counts_subscribers() {
        let bus = BroadcastBus::new(16);
        let group = bus.group("/place").await;
        let mut rx = group.subscribe(Subscriber::new(None)).await;
        let _rx2 = group.subscribe(Subscriber::new(None)).await;

        assert_eq!(broadcast_activity(&bus, "/place").await.unwrap(), 2);
        let frame = rx.recv().await.unwrap();
        assert_eq!(BroadcastEvent::decode(&frame).unwrap(), BroadcastEvent::activity(2));
    }

    #[tokio::test]
    async fn test_activity_on_empty_namespace() {
        let bus = BroadcastBus::new(16);
        assert_eq!(broadcast_activity(&bus, "/place").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_ticks() {
        let bus = Arc::new(BroadcastBus::new(16));
        let mut rx = bus.group("/place").await.subscribe(Subscriber::new(None)).await;

        let handle = spawn(bus.clone(), "/place".to_string(), Duration::from_secs(5));
        // First tick fires immediately.
        assert!(rx.recv().await.is_ok());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rx.recv().await.is_ok());
        handle.abort();
    }
}
