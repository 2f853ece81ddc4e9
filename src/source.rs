//! Task sources: the per-dataset adapters that produce fetch tasks
//!
//! A [`TaskSource`] yields a finite stream of [`FetchTask`]s; the stream ending is the
//! completion signal. Dataset adapters are plugged into the orchestrator as trait
//! objects, so scraping logic never has to share a base type.

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::FetchTask;

/// Producer of fetch tasks for one dataset
///
/// No ordering or uniqueness guarantee is required: the orchestrator deduplicates
/// partitions (last one wins) before anything is classified.
pub trait TaskSource: Send + Sync {
    /// Lazily produce the tasks of one run
    fn tasks(&self) -> BoxStream<'_, FetchTask>;
}

/// Task source backed by a fixed list
#[derive(Clone, Debug, Default)]
pub struct StaticTaskSource {
    tasks: Vec<FetchTask>,
}

impl StaticTaskSource {
    /// Source yielding `tasks` in order
    pub fn new(tasks: Vec<FetchTask>) -> Self {
        Self { tasks }
    }
}

impl FromIterator<FetchTask> for StaticTaskSource {
    fn from_iter<I: IntoIterator<Item = FetchTask>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl TaskSource for StaticTaskSource {
    fn tasks(&self) -> BoxStream<'_, FetchTask> {
        stream::iter(self.tasks.iter().cloned()).boxed()
    }
}

/// Task source fed by a producer task through a channel
///
/// Useful when link discovery itself is asynchronous (paging through an index,
/// crawling a listing). The stream ends once every sender is dropped. The receiver
/// can only be consumed once; later calls to [`tasks`](TaskSource::tasks) yield nothing.
pub struct ChannelTaskSource {
    receiver: Mutex<Option<mpsc::Receiver<FetchTask>>>,
}

impl ChannelTaskSource {
    /// Create a source and the sender a producer pushes tasks into
    pub fn channel(buffer: usize) -> (mpsc::Sender<FetchTask>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Self {
                receiver: Mutex::new(Some(rx)),
            },
        )
    }
}

impl TaskSource for ChannelTaskSource {
    fn tasks(&self) -> BoxStream<'_, FetchTask> {
        let receiver = self.receiver.lock().ok().and_then(|mut guard| guard.take());
        match receiver {
            Some(rx) => ReceiverStream::new(rx).boxed(),
            None => {
                tracing::warn!("channel task source already consumed");
                stream::empty().boxed()
            }
        }
    }
}
