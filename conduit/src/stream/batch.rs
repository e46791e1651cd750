use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;

// Adapted from tokio-stream's `chunks_timeout`.
pin_project! {
    /// Groups items into batches of at most `batch_size`.
    ///
    /// A batch is emitted when it is full, when upstream ends, or when `flush_timeout` elapsed since
    /// the batch was started. Items keep their order within and across batches.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct BatchStream<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        items: Vec<S::Item>,
        batch_size: usize,
        flush_timeout: Option<Duration>,
        ended: bool,
    }
}

impl<S: Stream> BatchStream<S> {
    /// Creates a new [`BatchStream`] emitting batches of `batch_size` items.
    ///
    /// With a `flush_timeout`, a partial batch is emitted once the timeout passed since its
    /// first item.
    pub fn new(stream: S, batch_size: usize, flush_timeout: Option<Duration>) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            stream,
            deadline: None,
            items: Vec::with_capacity(batch_size),
            batch_size,
            flush_timeout,
            ended: false,
        }
    }

    /// Returns the maximum number of items per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<S: Stream> Stream for BatchStream<S> {
    type Item = Vec<S::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.ended {
            return Poll::Ready(None);
        }

        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(item)) => {
                    if this.items.is_empty() {
                        // The timer starts with the first item of a batch.
                        if let Some(timeout) = *this.flush_timeout {
                            this.deadline.set(Some(tokio::time::sleep(timeout)));
                        }
                        this.items.reserve_exact(*this.batch_size);
                    }

                    this.items.push(item);
                    if this.items.len() >= *this.batch_size {
                        this.deadline.set(None);
                        return Poll::Ready(Some(std::mem::take(this.items)));
                    }
                }
                Poll::Ready(None) => {
                    *this.ended = true;
                    this.deadline.set(None);

                    let last = if this.items.is_empty() {
                        None
                    } else {
                        Some(std::mem::take(this.items))
                    };
                    return Poll::Ready(last);
                }
            }
        }

        if !this.items.is_empty() {
            if let Some(deadline) = this.deadline.as_mut().as_pin_mut() {
                ready!(deadline.poll(cx));
                this.deadline.set(None);

                return Poll::Ready(Some(std::mem::take(this.items)));
            }
        }

        Poll::Pending
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let buffered = self.items.len();
        let (lower, upper) = self.stream.size_hint();
        let lower = (lower + buffered).div_ceil(self.batch_size);
        let upper = upper.map(|upper| (upper + buffered).div_ceil(self.batch_size));
        (lower, upper)
    }
}
