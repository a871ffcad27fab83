//! Fixed-size batching between the parser and the upsert engine

use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt, TryChunksError, TryStreamExt};

use super::parser::RowRecord;
use super::ImportResult;

pub type BatchStream = BoxStream<'static, ImportResult<Vec<RowRecord>>>;

/// Group a row stream into batches of `size`, the last one possibly short.
///
/// The first error from `rows` is yielded and ends the stream; rows buffered
/// before it are discarded.
pub fn batches<S>(rows: S, size: usize) -> BatchStream
where
    S: Stream<Item = ImportResult<RowRecord>> + Send + 'static,
{
    rows.try_chunks(size.max(1))
        .map_err(|TryChunksError(_, e)| e)
        .scan(false, |failed, batch| {
            if *failed {
                return future::ready(None);
            }
            *failed = batch.is_err();
            future::ready(Some(batch))
        })
        .boxed()
}
