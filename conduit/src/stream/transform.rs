use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Instant;

use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;

use crate::error::ConduitResult;
use crate::stream::stats::StreamStats;

pin_project! {
    /// Applies an async function to every item, one item at a time.
    ///
    /// The function maps an item to zero or one output, so outputs keep the order of their inputs.
    /// Errors are yielded in place of the output and the stream carries on with the next item.
    #[must_use = "streams do nothing unless polled"]
    pub struct TransformStream<S, F, Fut> {
        #[pin]
        stream: S,
        #[pin]
        pending: Option<Fut>,
        f: F,
        started: Option<Instant>,
        stats: StreamStats,
    }
}

impl<S, F, Fut> TransformStream<S, F, Fut> {
    /// Creates a new [`TransformStream`] applying `f` to every item, one at a time.
    pub fn new(stream: S, stats: StreamStats, f: F) -> Self {
        Self {
            stream,
            pending: None,
            f,
            started: None,
            stats,
        }
    }

    /// Returns the counters of this stream.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}

impl<S, F, Fut, U> Stream for TransformStream<S, F, Fut>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = ConduitResult<Option<U>>>,
{
    type Item = ConduitResult<U>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(pending) = this.pending.as_mut().as_pin_mut() {
                let output = ready!(pending.poll(cx));
                this.pending.set(None);

                let elapsed = this.started.take().map(|s| s.elapsed()).unwrap_or_default();
                match output {
                    Ok(Some(output)) => {
                        this.stats.record_processed(elapsed);
                        return Poll::Ready(Some(Ok(output)));
                    }
                    // Filtered out.
                    Ok(None) => this.stats.record_processed(elapsed),
                    Err(err) => {
                        this.stats.record_error();
                        return Poll::Ready(Some(Err(err)));
                    }
                }
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(item) => {
                    *this.started = Some(Instant::now());
                    this.pending.set(Some((this.f)(item)));
                }
                None => return Poll::Ready(None),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pending = usize::from(self.pending.is_some());
        let (_, upper) = self.stream.size_hint();
        (0, upper.and_then(|upper| upper.checked_add(pending)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use futures::stream;

    use super::*;
    use crate::conduit_error;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn keeps_input_order_and_surfaces_errors() {
        let stats = StreamStats::new();
        let transformed = TransformStream::new(stream::iter(1..=6u64), stats.clone(), |n| async move {
            // Later items finish faster, which must not reorder the output.
            tokio::time::sleep(Duration::from_millis(7 - n)).await;
            match n {
                3 => Ok(None),
                5 => Err(conduit_error!(ErrorKind::ConversionError, "Odd value")),
                n => Ok(Some(n * 10)),
            }
        });

        let outputs: Vec<_> = transformed.collect().await;
        let values: Vec<_> = outputs.iter().filter_map(|o| o.as_ref().ok().copied()).collect();

        assert_eq!(values, vec![10, 20, 40, 60]);
        assert!(outputs[3].is_err());

        let metrics = stats.snapshot();
        assert_eq!(metrics.processed, 5);
        assert_eq!(metrics.errors, 1);
    }
}
