//! Sequential concatenation of chunk streams

use futures::{stream, StreamExt};

use csend_core::ByteStream;

/// Drain `streams` one after another as a single stream.
///
/// Input `n + 1` is not polled until input `n` has ended, and the output ends
/// after the last input does. Errors are passed through in position.
pub fn concat_streams(streams: Vec<ByteStream>) -> ByteStream {
    stream::iter(streams).flatten().boxed()
}
