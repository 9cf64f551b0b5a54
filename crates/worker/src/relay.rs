//! Streaming relay
//!
//! Forwards a facade's batches to the host one at a time, in arrival order.
//! Nothing is read ahead: the facade is only polled when the host asks for
//! the next batch. The first error is forwarded and ends the stream.

use futures::StreamExt;
use llmrelay_host::BatchStream;

pub fn relay(batches: BatchStream) -> BatchStream {
    Box::pin(async_stream::stream! {
        let mut batches = batches;
        while let Some(item) = batches.next().await {
            let failed = item.is_err();
            yield item;
            if failed {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use llmrelay_common::{RelayError, Result};
    use llmrelay_proto::OutputBatch;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn batches(n: usize) -> Vec<Result<OutputBatch>> {
        (0..n).map(|i| Ok(OutputBatch::new(json!(i)))).collect()
    }

    #[tokio::test]
    async fn test_forwards_every_batch_in_order() {
        for n in [0, 1, 7] {
            let out: Vec<_> = relay(Box::pin(stream::iter(batches(n)))).collect().await;
            let values: Vec<_> = out.into_iter().map(|b| b.unwrap().into_inner()).collect();
            let expected: Vec<_> = (0..n).map(|i| json!(i)).collect();
            assert_eq!(values, expected);
        }
    }

    #[tokio::test]
    async fn test_stops_after_first_error() {
        let mut items = batches(2);
        items.push(Err(RelayError::engine("UpstreamError", "boom")));
        items.extend(batches(3));

        let out: Vec<_> = relay(Box::pin(stream::iter(items))).collect().await;
        assert_eq!(out.len(), 3);
        assert!(out[2].is_err());
    }

    #[tokio::test]
    async fn test_pulls_lazily() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let source = stream::iter(0..10).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RelayError>(OutputBatch::new(json!(i)))
        });

        let mut relayed = relay(Box::pin(source));
        relayed.next().await.unwrap().unwrap();
        relayed.next().await.unwrap().unwrap();
        assert_eq!(polled.load(Ordering::SeqCst), 2);
    }
}
