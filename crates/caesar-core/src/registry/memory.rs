//! Process-local registry with the same contract as the POSIX one.
//!
//! Names live in a shared table; handles keep their object alive after the
//! name is destroyed, like an unlinked POSIX object. Failures can be injected
//! per operation name to exercise fail-fast paths.

use super::{
    validate_name, MessageQueue, NamedMutex, NamedResourceRegistry, QueueCapacity, QueueMessage,
    ResourceKind, SharedRegion,
};
use crate::error::{CaesarError, Result};
use crate::payload::RawPayload;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io::ErrorKind;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// In-memory [`NamedResourceRegistry`]. Clones share the same namespace.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    queues: HashMap<String, Arc<QueueShared>>,
    regions: HashMap<String, Arc<Mutex<RawPayload>>>,
    mutexes: HashMap<String, Arc<SemaphoreShared>>,
    /// Operations that fail the next time they are attempted.
    injected: Vec<&'static str>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` (`mq_open`, `shm_open`, `sem_open`,
    /// `mq_unlink`, ...) fail with an OS-style error.
    pub fn fail_next(&self, operation: &'static str) {
        lock(&self.state).injected.push(operation);
    }

    /// Names currently registered, sorted.
    pub fn names(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut names: Vec<String> = state
            .queues
            .keys()
            .chain(state.regions.keys())
            .chain(state.mutexes.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn check(
        state: &mut RegistryState,
        operation: &'static str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<()> {
        validate_name(operation, kind, name)?;
        if let Some(pos) = state.injected.iter().position(|op| *op == operation) {
            state.injected.remove(pos);
            return Err(CaesarError::resource(
                operation,
                kind,
                name,
                std::io::Error::new(ErrorKind::Other, "injected failure"),
            ));
        }
        Ok(())
    }

    fn create<T>(
        &self,
        operation: &'static str,
        kind: ResourceKind,
        name: &str,
        table: impl FnOnce(&mut RegistryState) -> &mut HashMap<String, Arc<T>>,
        value: T,
    ) -> Result<Arc<T>> {
        let mut state = lock(&self.state);
        Self::check(&mut *state, operation, kind, name)?;
        let table = table(&mut *state);
        if table.contains_key(name) {
            return Err(CaesarError::resource(
                operation,
                kind,
                name,
                std::io::Error::from(ErrorKind::AlreadyExists),
            ));
        }
        let value = Arc::new(value);
        table.insert(name.to_string(), value.clone());
        debug!("Created in-memory {} {}", kind, name);
        Ok(value)
    }

    fn open<T>(
        &self,
        operation: &'static str,
        kind: ResourceKind,
        name: &str,
        table: impl FnOnce(&mut RegistryState) -> &mut HashMap<String, Arc<T>>,
    ) -> Result<Arc<T>> {
        let mut state = lock(&self.state);
        Self::check(&mut *state, operation, kind, name)?;
        table(&mut *state).get(name).cloned().ok_or_else(|| {
            CaesarError::resource(
                operation,
                kind,
                name,
                std::io::Error::from(ErrorKind::NotFound),
            )
        })
    }
}

impl NamedResourceRegistry for InMemoryRegistry {
    type Queue = MemoryQueue;
    type Region = MemoryRegion;
    type Mutex = MemoryMutex;

    fn create_queue(&self, name: &str, capacity: QueueCapacity) -> Result<MemoryQueue> {
        let shared = self.create(
            "mq_open",
            ResourceKind::Queue,
            name,
            |s| &mut s.queues,
            QueueShared::new(capacity),
        )?;
        Ok(MemoryQueue {
            name: name.to_string(),
            shared,
        })
    }

    fn open_queue(&self, name: &str) -> Result<MemoryQueue> {
        let shared = self.open("mq_open", ResourceKind::Queue, name, |s| &mut s.queues)?;
        Ok(MemoryQueue {
            name: name.to_string(),
            shared,
        })
    }

    fn create_region(&self, name: &str) -> Result<MemoryRegion> {
        let cell = self.create(
            "shm_open",
            ResourceKind::SharedRegion,
            name,
            |s| &mut s.regions,
            Mutex::new(RawPayload::empty()),
        )?;
        Ok(MemoryRegion { cell })
    }

    fn open_region(&self, name: &str) -> Result<MemoryRegion> {
        let cell = self.open("shm_open", ResourceKind::SharedRegion, name, |s| {
            &mut s.regions
        })?;
        Ok(MemoryRegion { cell })
    }

    fn create_mutex(&self, name: &str) -> Result<MemoryMutex> {
        let shared = self.create(
            "sem_open",
            ResourceKind::Mutex,
            name,
            |s| &mut s.mutexes,
            SemaphoreShared::available(),
        )?;
        Ok(MemoryMutex { shared })
    }

    fn open_mutex(&self, name: &str) -> Result<MemoryMutex> {
        let shared = self.open("sem_open", ResourceKind::Mutex, name, |s| &mut s.mutexes)?;
        Ok(MemoryMutex { shared })
    }

    fn destroy(&self, name: &str, kind: ResourceKind) -> Result<()> {
        let operation = match kind {
            ResourceKind::Queue => "mq_unlink",
            ResourceKind::SharedRegion => "shm_unlink",
            ResourceKind::Mutex => "sem_unlink",
        };
        let mut state = lock(&self.state);
        Self::check(&mut *state, operation, kind, name)?;
        let removed = match kind {
            ResourceKind::Queue => state.queues.remove(name).is_some(),
            ResourceKind::SharedRegion => state.regions.remove(name).is_some(),
            ResourceKind::Mutex => state.mutexes.remove(name).is_some(),
        };
        if !removed {
            return Err(CaesarError::resource(
                operation,
                kind,
                name,
                std::io::Error::from(ErrorKind::NotFound),
            ));
        }
        debug!("Destroyed in-memory {} {}", kind, name);
        Ok(())
    }
}

// ========================================
// Queue
// ========================================

#[derive(Debug, PartialEq, Eq)]
struct Pending {
    priority: u32,
    seq: u64,
    bytes: Vec<u8>,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BinaryHeap<Pending>,
    next_seq: u64,
}

#[derive(Debug)]
struct QueueShared {
    capacity: QueueCapacity,
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
}

impl QueueShared {
    fn new(capacity: QueueCapacity) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }
}

/// Wait on `cond` until `ready` holds or `wait` elapses.
fn wait_until<'a, T>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    wait: Duration,
    ready: impl Fn(&T) -> bool,
) -> (MutexGuard<'a, T>, bool) {
    let deadline = Instant::now() + wait;
    while !ready(&guard) {
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        guard = cond
            .wait_timeout(guard, deadline - now)
            .map(|(g, _)| g)
            .unwrap_or_else(|poisoned| poisoned.into_inner().0);
    }
    (guard, true)
}

/// Handle to an in-memory queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    shared: Arc<QueueShared>,
}

impl MessageQueue for MemoryQueue {
    fn send(&self, bytes: &[u8], priority: u32, wait: Duration) -> Result<bool> {
        if bytes.len() > self.shared.capacity.message_size {
            return Err(CaesarError::resource(
                "mq_timedsend",
                ResourceKind::Queue,
                &self.name,
                std::io::Error::new(ErrorKind::InvalidInput, "message too long"),
            ));
        }
        let max = self.shared.capacity.max_messages;
        let guard = lock(&self.shared.state);
        let (mut state, ready) =
            wait_until(&self.shared.writable, guard, wait, |s| s.pending.len() < max);
        if !ready {
            return Ok(false);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(Pending {
            priority,
            seq,
            bytes: bytes.to_vec(),
        });
        self.shared.readable.notify_one();
        Ok(true)
    }

    fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>> {
        let guard = lock(&self.shared.state);
        let (mut state, ready) =
            wait_until(&self.shared.readable, guard, wait, |s| !s.pending.is_empty());
        if !ready {
            return Ok(None);
        }
        let next = state.pending.pop().map(|p| QueueMessage {
            bytes: p.bytes,
            priority: p.priority,
        });
        self.shared.writable.notify_one();
        Ok(next)
    }
}

// ========================================
// Region
// ========================================

/// Handle to an in-memory payload region.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    cell: Arc<Mutex<RawPayload>>,
}

impl SharedRegion for MemoryRegion {
    fn load(&self) -> RawPayload {
        *lock(&self.cell)
    }

    fn store(&self, payload: &RawPayload) {
        *lock(&self.cell) = *payload;
    }
}

// ========================================
// Mutex
// ========================================

#[derive(Debug)]
struct SemaphoreShared {
    available: Mutex<bool>,
    cond: Condvar,
}

impl SemaphoreShared {
    fn available() -> Self {
        Self {
            available: Mutex::new(true),
            cond: Condvar::new(),
        }
    }
}

/// Handle to an in-memory binary semaphore.
#[derive(Debug, Clone)]
pub struct MemoryMutex {
    shared: Arc<SemaphoreShared>,
}

impl NamedMutex for MemoryMutex {
    fn acquire(&self, wait: Duration) -> Result<bool> {
        let guard = lock(&self.shared.available);
        let (mut available, ready) = wait_until(&self.shared.cond, guard, wait, |a| *a);
        if ready {
            *available = false;
        }
        Ok(ready)
    }

    fn release(&self) -> Result<()> {
        *lock(&self.shared.available) = true;
        self.shared.cond.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_create_is_exclusive() {
        let registry = InMemoryRegistry::new();
        registry
            .create_queue("/mq_test", QueueCapacity::default())
            .unwrap();
        let err = registry
            .create_queue("/mq_test", QueueCapacity::default())
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(err.operation(), Some("mq_open"));
    }

    #[test]
    fn test_open_after_destroy_is_not_found() {
        let registry = InMemoryRegistry::new();
        registry.create_region("/shm_test").unwrap();
        registry.destroy("/shm_test", ResourceKind::SharedRegion).unwrap();

        let err = registry.open_region("/shm_test").unwrap_err();
        assert!(err.is_not_found());
        assert!(!registry
            .exists("/shm_test", ResourceKind::SharedRegion)
            .unwrap());
        assert!(registry.destroy_if_exists("/shm_test", ResourceKind::SharedRegion).is_ok());
    }

    #[test]
    fn test_kinds_have_separate_namespaces() {
        let registry = InMemoryRegistry::new();
        registry.create_mutex("/same").unwrap();
        registry.create_region("/same").unwrap();
        assert_eq!(registry.names(), vec!["/same".to_string(), "/same".to_string()]);
    }

    #[test]
    fn test_priority_order_then_fifo() {
        let registry = InMemoryRegistry::new();
        let queue = registry
            .create_queue("/mq_prio", QueueCapacity::default())
            .unwrap();

        queue.send(b"low-1", 0, SHORT).unwrap();
        queue.send(b"high", 7, SHORT).unwrap();
        queue.send(b"low-2", 0, SHORT).unwrap();
        queue.send(b"mid", 3, SHORT).unwrap();

        let order: Vec<String> = (0..4)
            .map(|_| queue.receive(SHORT).unwrap().unwrap().text())
            .collect();
        assert_eq!(order, vec!["high", "mid", "low-1", "low-2"]);
        assert!(queue.receive(SHORT).unwrap().is_none());
    }

    #[test]
    fn test_send_times_out_when_full() {
        let registry = InMemoryRegistry::new();
        let capacity = QueueCapacity {
            max_messages: 1,
            message_size: 8,
        };
        let queue = registry.create_queue("/mq_full", capacity).unwrap();
        assert!(queue.send(b"one", 0, SHORT).unwrap());
        assert!(!queue.send(b"two", 0, SHORT).unwrap());
        assert!(queue.send(b"way too long", 0, SHORT).is_err());
    }

    #[test]
    fn test_receive_wakes_on_send_from_other_thread() {
        let registry = InMemoryRegistry::new();
        let queue = registry
            .create_queue("/mq_wake", QueueCapacity::default())
            .unwrap();
        let sender = registry.open_queue("/mq_wake").unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.send(b"ack", 0, SHORT).unwrap();
        });

        let msg = queue.receive(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(msg.text(), "ack");
        handle.join().unwrap();
    }

    #[test]
    fn test_mutex_starts_available_and_excludes() {
        let registry = InMemoryRegistry::new();
        let a = registry.create_mutex("/sem_test").unwrap();
        let b = registry.open_mutex("/sem_test").unwrap();

        assert!(a.acquire(SHORT).unwrap());
        assert!(!b.acquire(SHORT).unwrap());
        a.release().unwrap();
        assert!(b.acquire(SHORT).unwrap());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let registry = InMemoryRegistry::new();
        registry.fail_next("sem_open");

        let err = registry.create_mutex("/sem_fail").unwrap_err();
        assert_eq!(err.operation(), Some("sem_open"));
        assert!(err.is_fatal());
        assert!(registry.create_mutex("/sem_fail").is_ok());
    }

    #[test]
    fn test_handles_outlive_destroyed_name() {
        let registry = InMemoryRegistry::new();
        let queue = registry
            .create_queue("/mq_unlinked", QueueCapacity::default())
            .unwrap();
        registry.destroy("/mq_unlinked", ResourceKind::Queue).unwrap();
        assert!(queue.send(b"still works", 0, SHORT).unwrap());
        assert_eq!(queue.receive(SHORT).unwrap().unwrap().text(), "still works");
    }
}
