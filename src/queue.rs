//! Submission/completion queue pair bookkeeping.
//!
//! Queues reference each other ("peer") by stable numeric id rather than by
//! direct reference, so the submission and completion sides can be looked up
//! independently through [`QueueTable`] without cyclic ownership.

use std::collections::HashMap;

pub const ADMIN_QUEUE_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Submission,
    Completion,
}

#[derive(Debug, Clone)]
pub struct Queue {
    pub id: u16,
    pub direction: Direction,
    /// Entry count (not 0-based here - this is the actual number of slots).
    pub size: u16,
    pub head: u16,
    pub tail: u16,
    pub base_address: u64,
    pub entry_size: usize,
    /// Id of the mapped queue on the opposite direction, if linked.
    pub peer: Option<u16>,
    /// Only meaningful for completion queues.
    pub phase: bool,
    /// Whether this completion queue was created with IEN set (Create I/O CQ
    /// DW11 bit 1). Unused on submission queues.
    pub interrupt_enabled: bool,
    /// Interrupt vector from Create I/O CQ DW11[31:16]. Unused on submission
    /// queues.
    pub interrupt_vector: u16,
    /// Set when a completion is posted on an interrupt-enabled completion
    /// queue; modeled as a pending bit since real MSI/MSI-X delivery is out
    /// of scope (spec §4.8).
    pub interrupt_pending: bool,
}

impl Queue {
    pub fn new(id: u16, direction: Direction, size: u16, base_address: u64, entry_size: usize) -> Self {
        Self {
            id,
            direction,
            size,
            head: 0,
            tail: 0,
            base_address,
            entry_size,
            peer: None,
            phase: false,
            interrupt_enabled: false,
            interrupt_vector: 0,
            interrupt_pending: false,
        }
    }

    /// Builder used by Create I/O Completion Queue to record IEN/IV.
    pub fn with_interrupt(mut self, enabled: bool, vector: u16) -> Self {
        self.interrupt_enabled = enabled;
        self.interrupt_vector = vector;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Host-driven tail advance (submission queues). Fails if `new_tail` is
    /// out of range - a protocol error the dispatcher turns into an
    /// asynchronous-event condition rather than a crash.
    pub fn advance_tail(&mut self, new_tail: u16) -> bool {
        if new_tail >= self.size {
            return false;
        }
        self.tail = new_tail;
        true
    }

    /// Controller-driven head advance after fetching a command (submission
    /// queues). Returns the number of commands still outstanding between
    /// the new head and the current tail.
    pub fn advance_head(&mut self) -> u16 {
        self.head = (self.head + 1) % self.size;
        self.in_flight_count()
    }

    pub fn in_flight_count(&self) -> u16 {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            self.size - self.head + self.tail
        }
    }

    /// Controller-driven tail advance after posting a completion
    /// (completion queues). Returns `true` if the queue wrapped, in which
    /// case the caller must flip `phase`.
    pub fn advance_tail_wrapping(&mut self) -> bool {
        self.tail = (self.tail + 1) % self.size;
        let wrapped = self.tail == 0;
        if wrapped {
            self.phase = !self.phase;
        }
        wrapped
    }

    pub fn byte_offset_of(&self, index: u16) -> u64 {
        self.base_address + (index as u64) * (self.entry_size as u64)
    }
}

/// Owns every live queue, keyed by (direction, id) so submission queue 1 and
/// completion queue 1 are distinct entries even though they share an id.
#[derive(Default)]
pub struct QueueTable {
    submission: HashMap<u16, Queue>,
    completion: HashMap<u16, Queue>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, queue: Queue) {
        match queue.direction {
            Direction::Submission => {
                self.submission.insert(queue.id, queue);
            }
            Direction::Completion => {
                self.completion.insert(queue.id, queue);
            }
        }
    }

    pub fn submission(&self, id: u16) -> Option<&Queue> {
        self.submission.get(&id)
    }

    pub fn submission_mut(&mut self, id: u16) -> Option<&mut Queue> {
        self.submission.get_mut(&id)
    }

    pub fn completion(&self, id: u16) -> Option<&Queue> {
        self.completion.get(&id)
    }

    pub fn completion_mut(&mut self, id: u16) -> Option<&mut Queue> {
        self.completion.get_mut(&id)
    }

    pub fn has_submission(&self, id: u16) -> bool {
        self.submission.contains_key(&id)
    }

    pub fn has_completion(&self, id: u16) -> bool {
        self.completion.contains_key(&id)
    }

    /// Links a submission queue to its completion queue peer, both ways.
    pub fn link_peers(&mut self, sq_id: u16, cq_id: u16) {
        if let Some(sq) = self.submission.get_mut(&sq_id) {
            sq.peer = Some(cq_id);
        }
        if let Some(cq) = self.completion.get_mut(&cq_id) {
            cq.peer = Some(sq_id);
        }
    }

    pub fn remove_submission(&mut self, id: u16) -> Option<Queue> {
        self.submission.remove(&id)
    }

    pub fn remove_completion(&mut self, id: u16) -> Option<Queue> {
        self.completion.remove(&id)
    }

    /// Every submission queue id currently live, admin queue first.
    pub fn submission_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.submission.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Deletes every I/O queue pair (id != 0), keeping the admin pair.
    /// Used by the reset coordinator.
    pub fn delete_io_queues(&mut self) {
        self.submission.retain(|&id, _| id == ADMIN_QUEUE_ID);
        self.completion.retain(|&id, _| id == ADMIN_QUEUE_ID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_tail_rejects_out_of_range() {
        let mut q = Queue::new(0, Direction::Submission, 4, 0x1000, 64);
        assert!(q.advance_tail(3));
        assert!(!q.advance_tail(4));
        assert_eq!(q.tail, 3);
    }

    #[test]
    fn advance_head_wraps_and_reports_in_flight() {
        let mut q = Queue::new(0, Direction::Submission, 4, 0x1000, 64);
        q.advance_tail(2);
        assert_eq!(q.advance_head(), 1);
        assert_eq!(q.head, 1);
        assert_eq!(q.advance_head(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn completion_queue_flips_phase_on_wrap() {
        let mut cq = Queue::new(0, Direction::Completion, 2, 0x2000, 16);
        assert!(!cq.phase);
        assert!(!cq.advance_tail_wrapping());
        assert!(cq.advance_tail_wrapping());
        assert!(cq.phase);
    }

    #[test]
    fn queue_table_links_peers_both_ways() {
        let mut table = QueueTable::new();
        table.insert(Queue::new(1, Direction::Submission, 4, 0x1000, 64));
        table.insert(Queue::new(1, Direction::Completion, 4, 0x2000, 16));
        table.link_peers(1, 1);
        assert_eq!(table.submission(1).unwrap().peer, Some(1));
        assert_eq!(table.completion(1).unwrap().peer, Some(1));
    }

    #[test]
    fn delete_io_queues_keeps_admin() {
        let mut table = QueueTable::new();
        table.insert(Queue::new(ADMIN_QUEUE_ID, Direction::Submission, 2, 0, 64));
        table.insert(Queue::new(1, Direction::Submission, 4, 0x1000, 64));
        table.delete_io_queues();
        assert!(table.has_submission(ADMIN_QUEUE_ID));
        assert!(!table.has_submission(1));
    }
}
