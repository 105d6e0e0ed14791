use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::job::JobPriority;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Pending,
    Waiting,
    Completed,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueKind::Pending => "pending",
            QueueKind::Waiting => "waiting",
            QueueKind::Completed => "completed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    Fifo,
    #[default]
    Priority,
}

// Backpressure policy: fail fast when a queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("{0} queue full")]
    Full(QueueKind),
    #[error("{0} queue closed")]
    Closed(QueueKind),
}

pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    wake: Condvar,
    capacity: usize,
    kind: QueueKind,
    ordering: QueueOrdering,
}

struct QueueState<T> {
    lanes: Vec<VecDeque<T>>,
    len: usize,
    shutdown: bool,
}

impl<T> QueueState<T> {
    // Highest lane first; FIFO inside a lane.
    fn pop_front(&mut self) -> Option<T> {
        for lane in self.lanes.iter_mut().rev() {
            if let Some(item) = lane.pop_front() {
                self.len -= 1;
                return Some(item);
            }
        }
        None
    }
}

impl<T> BlockingQueue<T> {
    pub fn new(kind: QueueKind, capacity: usize, ordering: QueueOrdering) -> Self {
        let lane_count = match ordering {
            QueueOrdering::Fifo => 1,
            QueueOrdering::Priority => JobPriority::ALL.len(),
        };
        Self {
            state: Mutex::new(QueueState {
                lanes: (0..lane_count).map(|_| VecDeque::new()).collect(),
                len: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            capacity: capacity.max(1),
            kind,
            ordering,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().expect("job queue lock poisoned")
    }

    fn lane(&self, priority: JobPriority) -> usize {
        match self.ordering {
            QueueOrdering::Fifo => 0,
            QueueOrdering::Priority => priority.lane(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, item: T, priority: JobPriority) -> Result<(), QueueError> {
        let mut guard = self.lock();
        if guard.shutdown {
            return Err(QueueError::Closed(self.kind));
        }
        if guard.len >= self.capacity {
            return Err(QueueError::Full(self.kind));
        }
        let lane = self.lane(priority);
        guard.lanes[lane].push_back(item);
        guard.len += 1;
        self.wake.notify_one();
        Ok(())
    }

    // With `wait`, blocks until an item arrives or the queue shuts down.
    // Without it, returns whatever is queued even after shutdown.
    pub fn pop(&self, wait: bool) -> Option<T> {
        let mut guard = self.lock();
        loop {
            if wait && guard.shutdown {
                return None;
            }
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            if !wait {
                return None;
            }
            guard = self.wake.wait(guard).expect("job queue lock poisoned");
        }
    }

    pub fn pop_matching<P>(&self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        let mut guard = self.lock();
        let lane_count = guard.lanes.len();
        for lane in (0..lane_count).rev() {
            let position = guard.lanes[lane].iter().position(&mut predicate);
            if let Some(position) = position {
                let item = guard.lanes[lane].remove(position);
                if item.is_some() {
                    guard.len -= 1;
                }
                return item;
            }
        }
        None
    }

    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.pop_matching(|queued| queued == item).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        let mut guard = self.lock();
        guard.shutdown = true;
        self.wake.notify_all();
    }

    pub fn drain(&self) -> Vec<T> {
        let mut guard = self.lock();
        let mut drained = Vec::with_capacity(guard.len);
        while let Some(item) = guard.pop_front() {
            drained.push(item);
        }
        drained
    }
}
