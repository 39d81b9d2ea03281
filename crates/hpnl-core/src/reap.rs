use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;

/// Connections waiting for teardown, handed from any thread to the polling loop.
#[derive(Default)]
pub struct ReapQueue {
    queue: Mutex<VecDeque<Arc<Connection>>>,
}

impl ReapQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, connection: Arc<Connection>) {
        self.queue.lock().push_back(connection);
    }

    /// Process the entries queued at call time, oldest first. Entries offered
    /// while `f` runs are left for the next drain. Returns the number processed.
    pub fn drain_all(&self, mut f: impl FnMut(Arc<Connection>)) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock());
        let n = batch.len();
        for connection in batch {
            f(connection);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
