//! Stream helpers

use futures::stream::{Stream, StreamExt};

/// Lazily apply a synchronous function to every item of an asynchronous
/// stream. Nothing is pulled from `stream` until the result is polled.
pub fn async_map<S, F, T>(f: F, stream: S) -> impl Stream<Item = T>
where
    S: Stream,
    F: FnMut(S::Item) -> T,
{
    stream.map(f)
}
