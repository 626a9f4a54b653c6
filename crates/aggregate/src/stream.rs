//! Streaming chunked aggregation.
//!
//! Consumes one lazy row stream per source, buffering at most one chunk
//! per source at a time, and applies an aggregation callback to each
//! batch of chunks. This supports streaming merge directly, and partial
//! group-by via [`GroupByState`] with finalization at end-of-stream.
//! Streaming joins are NOT fully streaming: the build side of a join must
//! fit in memory.
//!
//! [`GroupByState`]: crate::GroupByState

use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::BTreeMap;

use models::Row;

/// One buffered chunk from each source which still had rows.
#[derive(Debug)]
pub struct ChunkBatch {
    pub chunk_index: usize,
    pub per_source: BTreeMap<String, Vec<Row>>,
}

impl ChunkBatch {
    pub fn total_rows(&self) -> usize {
        self.per_source.values().map(Vec::len).sum()
    }
}

/// Applies `aggregate` to successive chunk batches drawn from the source
/// streams, yielding its outputs until every source is exhausted.
pub fn stream_aggregate<F, T>(
    sources: BTreeMap<String, BoxStream<'static, Row>>,
    chunk_size: usize,
    aggregate: F,
) -> impl Stream<Item = T>
where
    F: FnMut(ChunkBatch) -> T,
{
    let fused: BTreeMap<_, _> = sources
        .into_iter()
        .map(|(source_id, stream)| (source_id, stream.fuse()))
        .collect();

    futures::stream::unfold(
        (fused, aggregate, 0usize),
        move |(mut fused, mut aggregate, chunk_index)| async move {
            let mut per_source = BTreeMap::new();
            for (source_id, stream) in fused.iter_mut() {
                let mut chunk = Vec::new();
                while chunk.len() < chunk_size {
                    match stream.next().await {
                        Some(row) => chunk.push(row),
                        None => break,
                    }
                }
                if !chunk.is_empty() {
                    per_source.insert(source_id.clone(), chunk);
                }
            }
            if per_source.is_empty() {
                return None;
            }
            let output = aggregate(ChunkBatch {
                chunk_index,
                per_source,
            });
            Some((output, (fused, aggregate, chunk_index + 1)))
        },
    )
}
