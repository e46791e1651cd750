use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::stream::{Fuse, FuturesUnordered};
use futures::{Future, Stream, StreamExt};
use pin_project_lite::pin_project;

use crate::error::ConduitResult;
use crate::stream::stats::StreamStats;

pin_project! {
    struct Timed<Fut> {
        #[pin]
        inner: Fut,
        started: Instant,
    }
}

impl<Fut: Future> Future for Timed<Fut> {
    type Output = (Fut::Output, Duration);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.inner
            .poll(cx)
            .map(|output| (output, this.started.elapsed()))
    }
}

pin_project! {
    /// Runs an async function over up to `max_concurrency` items at once.
    ///
    /// Upstream is only polled while a slot is free. Outputs are yielded as their futures
    /// complete, which is not necessarily the input order.
    #[must_use = "streams do nothing unless polled"]
    pub struct ParallelStream<S: Stream, F, Fut> {
        #[pin]
        stream: Fuse<S>,
        in_flight: FuturesUnordered<Timed<Fut>>,
        f: F,
        max_concurrency: usize,
        stats: StreamStats,
    }
}

impl<S: Stream, F, Fut> ParallelStream<S, F, Fut> {
    /// Creates a new [`ParallelStream`] running up to `max_concurrency` calls of `f` at once.
    pub fn new(stream: S, max_concurrency: usize, stats: StreamStats, f: F) -> Self {
        Self {
            stream: stream.fuse(),
            in_flight: FuturesUnordered::new(),
            f,
            max_concurrency: max_concurrency.max(1),
            stats,
        }
    }

    /// Returns the number of calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<S, F, Fut, U> Stream for ParallelStream<S, F, Fut>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = ConduitResult<Option<U>>>,
{
    type Item = ConduitResult<U>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            while this.in_flight.len() < *this.max_concurrency {
                match this.stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(item)) => this.in_flight.push(Timed {
                        inner: (this.f)(item),
                        started: Instant::now(),
                    }),
                    Poll::Ready(None) | Poll::Pending => break,
                }
            }

            match this.in_flight.poll_next_unpin(cx) {
                Poll::Ready(Some((output, elapsed))) => match output {
                    Ok(Some(output)) => {
                        this.stats.record_processed(elapsed);
                        return Poll::Ready(Some(Ok(output)));
                    }
                    Ok(None) => this.stats.record_processed(elapsed),
                    Err(err) => {
                        this.stats.record_error();
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                Poll::Ready(None) if this.stream.is_done() => return Poll::Ready(None),
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }
}
