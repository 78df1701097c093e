use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;

// Implementation adapted from:
//  https://github.com/tokio-rs/tokio/blob/master/tokio-stream/src/stream_ext/chunks_timeout.rs.
pin_project! {
    /// A stream adapter that groups items into batches.
    ///
    /// A batch is emitted when it reaches `max_size` items or when `max_fill` elapsed since its
    /// first item arrived, whichever comes first. An empty batch is never emitted.
    #[must_use = "streams do nothing unless polled"]
    pub struct BatchStream<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        items: Vec<S::Item>,
        max_size: usize,
        max_fill: Duration,
        inner_stream_ended: bool,
    }
}

impl<S: Stream> BatchStream<S> {
    pub fn wrap(stream: S, max_size: usize, max_fill: Duration) -> Self {
        let max_size = max_size.max(1);
        BatchStream {
            stream,
            deadline: None,
            items: Vec::with_capacity(max_size),
            max_size,
            max_fill,
            inner_stream_ended: false,
        }
    }
}

impl<S: Stream> Stream for BatchStream<S> {
    type Item = Vec<S::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.inner_stream_ended {
            return Poll::Ready(None);
        }

        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(item)) => {
                    // The fill timer starts with the first item of a batch.
                    if this.items.is_empty() {
                        this.deadline
                            .set(Some(tokio::time::sleep(*this.max_fill)));
                        this.items.reserve_exact(*this.max_size);
                    }

                    this.items.push(item);
                    if this.items.len() >= *this.max_size {
                        this.deadline.set(None);
                        return Poll::Ready(Some(std::mem::take(this.items)));
                    }
                }
                Poll::Ready(None) => {
                    *this.inner_stream_ended = true;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::future::poll_fn;

    #[tokio::test]
    async fn emits_full_batches_then_the_remainder() {
        let stream = BatchStream::wrap(
            futures::stream::iter(vec![1, 2, 3, 4, 5]),
            2,
            Duration::from_secs(60),
        );

        let batches: Vec<Vec<i32>> = stream.collect().await;
        assert_eq!(batches, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_partial_batch_after_fill_timeout() {
        let inner = futures::stream::iter(vec![7]).chain(futures::stream::pending::<i32>());
        let mut stream = Box::pin(BatchStream::wrap(inner, 10, Duration::from_millis(50)));

        poll_fn(|cx| match stream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Ready(()),
            _ => panic!("expected pending before the fill timeout"),
        })
        .await;

        // With a paused clock the runtime auto-advances to the fill deadline.
        let batch = stream.next().await;
        assert_eq!(batch, Some(vec![7]));
    }
}
