use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use conduit_config::shared::StreamConfig;
use futures::Stream;
use metrics::{counter, gauge};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use crate::bail;
use crate::error::{ConduitResult, ErrorKind};
use crate::events::{Event, EventBus};
use crate::metrics::{
    CONDUIT_BACKPRESSURE_EVENTS_TOTAL, CONDUIT_STREAM_BUFFERED_RECORDS, STAGE_LABEL,
};
use crate::stream::stats::StreamStats;

#[derive(Debug)]
struct Shared {
    stream_id: String,
    high_water_mark: usize,
    low_water_mark: usize,
    backpressure_control: bool,
    paused: AtomicBool,
    resume: Notify,
    stats: StreamStats,
    events: EventBus,
}

impl Shared {
    fn record_buffered(&self, buffered: usize) {
        gauge!(CONDUIT_STREAM_BUFFERED_RECORDS, STAGE_LABEL => self.stream_id.clone())
            .set(buffered as f64);
    }
}

/// Creates a bounded buffer between a producer and a consuming stream.
///
/// Once `high_water_mark` items are buffered the sender reports backpressure and waits until the
/// consumer drained the buffer down to `low_water_mark`. Without backpressure control the
/// sender only waits for a free slot.
pub fn bounded<T>(
    stream_id: impl Into<String>,
    config: &StreamConfig,
    events: EventBus,
) -> (BufferTx<T>, BufferRx<T>) {
    let high_water_mark = config.high_water_mark.max(1);
    let (tx, rx) = mpsc::channel(high_water_mark);
    let shared = Arc::new(Shared {
        stream_id: stream_id.into(),
        high_water_mark,
        low_water_mark: config.low_water_mark.min(high_water_mark),
        backpressure_control: config.enable_backpressure_control,
        paused: AtomicBool::new(false),
        resume: Notify::new(),
        stats: StreamStats::new(),
        events,
    });

    (
        BufferTx {
            tx,
            shared: shared.clone(),
        },
        BufferRx { rx, shared },
    )
}

#[derive(Debug)]
pub struct BufferTx<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for BufferTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> BufferTx<T> {
    /// Buffers `item`, waiting while the buffer is under backpressure.
    ///
    /// Fails with [`ErrorKind::InvalidState`] once the consumer is gone.
    pub async fn send(&self, item: T) -> ConduitResult<()> {
        if self.shared.backpressure_control {
            self.wait_for_capacity().await?;
        }

        let buffered = self.shared.stats.buffer_added();
        if self.tx.send(item).await.is_err() {
            self.shared.stats.buffer_removed();
            bail!(
                ErrorKind::InvalidState,
                "Stream consumer is gone",
                format!("stream '{}'", self.shared.stream_id)
            );
        }
        self.shared.record_buffered(buffered);

        Ok(())
    }

    async fn wait_for_capacity(&self) -> ConduitResult<()> {
        let shared = &self.shared;
        if shared.stats.buffered() < shared.high_water_mark {
            return Ok(());
        }

        if !shared.paused.swap(true, Ordering::AcqRel) {
            let buffered = shared.stats.buffered();
            info!(stream_id = %shared.stream_id, buffered, "backpressure active, producer paused");
            shared.stats.record_backpressure();
            counter!(CONDUIT_BACKPRESSURE_EVENTS_TOTAL, STAGE_LABEL => shared.stream_id.clone())
                .increment(1);
            shared.events.publish(Event::StreamBackpressure {
                stream_id: shared.stream_id.clone(),
                buffer: buffered,
            });
        }

        loop {
            let notified = shared.resume.notified();
            if !shared.paused.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.tx.is_closed() {
                bail!(
                    ErrorKind::InvalidState,
                    "Stream consumer is gone",
                    format!("stream '{}'", shared.stream_id)
                );
            }
            notified.await;
        }
    }

    /// Returns `true` while the buffer is above its high water mark.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &StreamStats {
        &self.shared.stats
    }
}

/// Consuming end of [`bounded`]. Yields items in the order they were sent.
#[derive(Debug)]
pub struct BufferRx<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> BufferRx<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.taken();
        Some(item)
    }

    pub fn stats(&self) -> &StreamStats {
        &self.shared.stats
    }

    fn taken(&self) {
        let shared = &self.shared;
        let buffered = shared.stats.buffer_removed();
        shared.record_buffered(buffered);

        if buffered <= shared.low_water_mark && shared.paused.swap(false, Ordering::AcqRel) {
            debug!(stream_id = %shared.stream_id, buffered, "backpressure released, producer resumed");
            shared.resume.notify_waiters();
        }
    }
}

impl<T> Stream for BufferRx<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                self.taken();
                Poll::Ready(Some(item))
            }
            other => other,
        }
    }
}

impl<T> Drop for BufferRx<T> {
    fn drop(&mut self) {
        self.rx.close();
        self.shared.resume.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_telemetry::tracing::init_test_tracing;

    use super::*;

    fn config(high: usize, low: usize) -> StreamConfig {
        StreamConfig {
            high_water_mark: high,
            low_water_mark: low,
            ..StreamConfig::default()
        }
    }

    #[tokio::test]
    async fn producer_pauses_until_low_water_mark() {
        init_test_tracing();
        let events = EventBus::default();
        let mut subscriber = events.subscribe();
        let (tx, mut rx) = bounded::<u32>("numbers", &config(4, 1), events);

        let producer = tokio::spawn({
            let tx = tx.clone();
            async move {
                for n in 0..6 {
                    tx.send(n).await.unwrap();
                }
            }
        });

        match subscriber.recv().await.unwrap() {
            Event::StreamBackpressure { stream_id, buffer } => {
                assert_eq!(stream_id, "numbers");
                assert_eq!(buffer, 4);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(tx.is_paused());

        // Draining to two items keeps the producer paused.
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tx.stats().buffered(), 2);

        let mut received = vec![];
        while received.len() < 4 {
            received.push(rx.recv().await.unwrap());
        }
        producer.await.unwrap();

        assert_eq!(received, vec![2, 3, 4, 5]);
        let metrics = rx.stats().snapshot();
        assert_eq!(metrics.backpressure_events, 1);
        assert_eq!(metrics.buffer_high_water_mark, 4);
    }

    #[tokio::test]
    async fn sending_fails_once_the_consumer_is_gone() {
        init_test_tracing();
        let (tx, rx) = bounded::<u32>("gone", &config(2, 1), EventBus::default());
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();

        let blocked = tokio::spawn(async move { tx.send(3).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rx);

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
