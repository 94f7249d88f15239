//! The command queue: the single ordering point for every game-state
//! mutation. One runner task drains it, so command bodies can
//! read-modify-write the database without locks.
//!
//! Two slots: an immediate FIFO and a deadline min-heap for delayed
//! entries. Entries carrying a semaphore park on a per-object label
//! until a notify releases them, FIFO per semaphore.

mod runner;

pub use runner::{run_startups, KernelExecutor, QueueRunner};

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use tokio::time::{Duration, Instant};

use crate::prelude::*;

/// One unit of queued work.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub executor: Dbref,
    pub caller: Dbref,
    pub command: String,
    /// Seconds before the entry becomes runnable. Zero or negative
    /// means immediately.
    pub delay: i64,
    pub semaphore: Option<(Dbref, String)>,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl QueueEntry {
    pub fn new(executor: Dbref, caller: Dbref, command: impl Into<String>) -> Self {
        Self {
            executor,
            caller,
            command: command.into(),
            delay: 0,
            semaphore: None,
            enqueued_at: chrono::Utc::now(),
        }
    }

    pub fn with_delay(mut self, delay: i64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_semaphore(mut self, obj: Dbref, label: impl Into<String>) -> Self {
        self.semaphore = Some((obj, label.into()));
        self
    }
}

/// Messages accepted by the runner's mailbox. Producers on any task
/// push here; only the runner touches game state.
#[derive(Debug)]
pub enum QueueMessage {
    Enqueue(QueueEntry),
    Notify {
        obj: Dbref,
        label: String,
        count: usize,
    },
    /// Drop queued entries belonging to an executor.
    Halt(Dbref),
    Broadcast(String),
    Archive,
    Shutdown {
        grace_secs: u64,
    },
}

struct Waiting {
    deadline: Instant,
    seq: u64,
    entry: QueueEntry,
}

// min-heap by (deadline, seq): BinaryHeap is a max-heap, so the
// ordering is reversed
impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Waiting {}

/// The two slots plus the semaphore parking lot. Purely synchronous;
/// the async runner drives it.
#[derive(Default)]
pub struct CommandQueue {
    immediate: VecDeque<QueueEntry>,
    waiting: BinaryHeap<Waiting>,
    semaphores: HashMap<(Dbref, String), VecDeque<QueueEntry>>,
    seq: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes an entry to the right slot.
    pub fn push(&mut self, entry: QueueEntry, now: Instant) {
        if let Some(sem) = entry.semaphore.clone() {
            self.semaphores.entry(sem).or_default().push_back(entry);
            return;
        }

        if entry.delay > 0 {
            let deadline = now + Duration::from_secs(entry.delay as u64);
            self.seq += 1;
            self.waiting.push(Waiting {
                deadline,
                seq: self.seq,
                entry,
            });
        } else {
            self.immediate.push_back(entry);
        }
    }

    /// Releases up to `count` parked entries from a semaphore, oldest
    /// first. Zero releases everything.
    pub fn notify(&mut self, obj: Dbref, label: &str, count: usize) -> usize {
        let key = (obj, label.to_owned());
        let Some(parked) = self.semaphores.get_mut(&key) else {
            return 0;
        };

        let n = if count == 0 {
            parked.len()
        } else {
            count.min(parked.len())
        };

        for _ in 0..n {
            if let Some(mut entry) = parked.pop_front() {
                entry.semaphore = None;
                self.immediate.push_back(entry);
            }
        }

        if parked.is_empty() {
            self.semaphores.remove(&key);
        }

        n
    }

    /// Moves every due waiting entry onto the immediate slot, deadline
    /// order, FIFO among equal deadlines.
    pub fn promote(&mut self, now: Instant) {
        while let Some(head) = self.waiting.peek() {
            if head.deadline > now {
                break;
            }
            if let Some(w) = self.waiting.pop() {
                self.immediate.push_back(w.entry);
            }
        }
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.immediate.pop_front()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.deadline)
    }

    /// Drops every queued or parked entry belonging to `executor`.
    pub fn halt(&mut self, executor: Dbref) -> usize {
        let before = self.depth();

        self.immediate.retain(|e| e.executor != executor);

        let kept: Vec<Waiting> = self
            .waiting
            .drain()
            .filter(|w| w.entry.executor != executor)
            .collect();
        self.waiting = kept.into_iter().collect();

        for parked in self.semaphores.values_mut() {
            parked.retain(|e| e.executor != executor);
        }
        self.semaphores.retain(|_, parked| !parked.is_empty());

        before - self.depth()
    }

    pub fn depth(&self) -> usize {
        self.immediate.len()
            + self.waiting.len()
            + self.semaphores.values().map(VecDeque::len).sum::<usize>()
    }
}

/// Per-entry budgets: a function-invocation counter and an output cap.
/// Exceeding either aborts the entry with a recoverable error; side
/// effects up to that point are kept.
pub struct Budget {
    used: u64,
    limit: u64,
    output_used: usize,
    output_limit: usize,
}

impl Budget {
    pub fn new(limit: u64, output_limit: usize) -> Self {
        Self {
            used: 0,
            limit,
            output_used: 0,
            output_limit,
        }
    }

    pub fn charge(&mut self, invocations: u64) -> Result<(), QueueError> {
        self.used += invocations;
        if self.used > self.limit {
            return Err(QueueError::QuotaExceeded);
        }
        Ok(())
    }

    pub fn charge_output(&mut self, bytes: usize) -> Result<(), QueueError> {
        self.output_used += bytes;
        if self.output_limit > 0 && self.output_used > self.output_limit {
            return Err(QueueError::OutputExceeded);
        }
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

/// The seam between the queue and the command language. The evaluator
/// is an external collaborator; the kernel ships a minimal executor
/// that understands the built-in communication verbs.
pub trait CommandExecutor: Send + 'static {
    fn execute(
        &mut self,
        world: &crate::world::World,
        entry: &QueueEntry,
        budget: &mut Budget,
    ) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cmd: &str) -> QueueEntry {
        QueueEntry::new(1, 1, cmd)
    }

    #[test]
    fn immediate_entries_drain_fifo() {
        let mut q = CommandQueue::new();
        let now = Instant::now();

        q.push(entry("first"), now);
        q.push(entry("second"), now);

        assert_eq!(q.pop().unwrap().command, "first");
        assert_eq!(q.pop().unwrap().command, "second");
        assert!(q.pop().is_none());
    }

    #[test]
    fn delayed_entries_wait_for_deadline() {
        let mut q = CommandQueue::new();
        let now = Instant::now();

        q.push(entry("later").with_delay(10), now);
        q.push(entry("now"), now);

        q.promote(now);
        assert_eq!(q.pop().unwrap().command, "now");
        assert!(q.pop().is_none());

        q.promote(now + Duration::from_secs(11));
        assert_eq!(q.pop().unwrap().command, "later");
    }

    #[test]
    fn promotion_orders_by_deadline_then_fifo() {
        let mut q = CommandQueue::new();
        let now = Instant::now();

        q.push(entry("slow").with_delay(20), now);
        q.push(entry("fast-a").with_delay(5), now);
        q.push(entry("fast-b").with_delay(5), now);

        q.promote(now + Duration::from_secs(30));

        assert_eq!(q.pop().unwrap().command, "fast-a");
        assert_eq!(q.pop().unwrap().command, "fast-b");
        assert_eq!(q.pop().unwrap().command, "slow");
    }

    #[test]
    fn semaphores_release_fifo() {
        let mut q = CommandQueue::new();
        let now = Instant::now();

        q.push(entry("a").with_semaphore(5, "sync"), now);
        q.push(entry("b").with_semaphore(5, "sync"), now);
        q.push(entry("other").with_semaphore(5, "different"), now);

        assert!(q.pop().is_none());

        assert_eq!(q.notify(5, "sync", 1), 1);
        assert_eq!(q.pop().unwrap().command, "a");
        assert!(q.pop().is_none());

        assert_eq!(q.notify(5, "sync", 0), 1);
        assert_eq!(q.pop().unwrap().command, "b");

        // the other label is untouched
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn notify_on_empty_semaphore_is_harmless() {
        let mut q = CommandQueue::new();
        assert_eq!(q.notify(5, "sync", 1), 0);
    }

    #[test]
    fn halt_drops_only_that_executor() {
        let mut q = CommandQueue::new();
        let now = Instant::now();

        q.push(QueueEntry::new(1, 1, "mine"), now);
        q.push(QueueEntry::new(2, 2, "theirs"), now);
        q.push(QueueEntry::new(1, 1, "mine later").with_delay(5), now);
        q.push(QueueEntry::new(1, 1, "parked").with_semaphore(9, "x"), now);

        assert_eq!(q.halt(1), 3);
        assert_eq!(q.depth(), 1);
        assert_eq!(q.pop().unwrap().command, "theirs");
    }

    #[test]
    fn budget_aborts_past_limit() {
        let mut budget = Budget::new(10, 0);
        assert!(budget.charge(10).is_ok());
        assert!(matches!(
            budget.charge(1),
            Err(QueueError::QuotaExceeded)
        ));
        assert_eq!(budget.used(), 11);
    }

    #[test]
    fn output_budget_aborts_past_limit() {
        let mut budget = Budget::new(10, 8);
        assert!(budget.charge_output(8).is_ok());
        assert!(matches!(
            budget.charge_output(1),
            Err(QueueError::OutputExceeded)
        ));

        // zero disables the output cap
        let mut unlimited = Budget::new(10, 0);
        assert!(unlimited.charge_output(1 << 20).is_ok());
    }
}
