//! Process-group collectives used by distributed blocks.
//!
//! A run executes either in single-process mode (`SelfComm`) or with a fixed
//! group of cooperating ranks. Collectives are synchronous: every rank of a
//! group must issue the same sequence of collective calls, or the group
//! deadlocks. This ordering discipline is a requirement on callers, not
//! something the types enforce.

use std::sync::{Arc, Barrier, Mutex};

pub type SharedComm = Arc<dyn Communicator>;

pub trait Communicator: Send + Sync {
    fn size(&self) -> usize;

    fn rank(&self) -> usize;

    fn barrier(&self);

    /// Gathers every rank's slice; all ranks receive the concatenation in
    /// rank order.
    fn allgather_usizes(&self, local: &[usize]) -> Vec<usize>;

    /// As `allgather_usizes`, for floating point payloads.
    fn allgather_f64s(&self, local: &[f64]) -> Vec<f64>;

    /// Gathers one count per rank, in rank order.
    fn allgather_count(&self, count: usize) -> Vec<usize> {
        let flat = self.allgather_usizes(&[count]);
        assert_eq!(flat.len(), self.size());
        flat
    }
}

/// The trivial single-rank group; every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn barrier(&self) {}

    fn allgather_usizes(&self, local: &[usize]) -> Vec<usize> {
        local.to_vec()
    }

    fn allgather_f64s(&self, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }
}

/// An in-process group of ranks backed by `std::sync` barriers.
///
/// `ThreadGroup::split(n)` hands out one handle per rank; each handle must be
/// driven from its own thread. Collectives block until all ranks arrive,
/// which gives the same deadlock semantics as a real process group and makes
/// the distributed code paths testable deterministically.
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

struct GroupShared {
    size: usize,
    barrier: Barrier,
    usize_slots: Mutex<Vec<Vec<usize>>>,
    f64_slots: Mutex<Vec<Vec<f64>>>,
}

impl ThreadGroup {
    pub fn split(size: usize) -> Vec<ThreadGroup> {
        assert!(size > 0, "a group must have at least one rank");
        let shared = Arc::new(GroupShared {
            size,
            barrier: Barrier::new(size),
            usize_slots: Mutex::new(vec![Vec::new(); size]),
            f64_slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Communicator for ThreadGroup {
    fn size(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn allgather_usizes(&self, local: &[usize]) -> Vec<usize> {
        self.shared.usize_slots.lock().unwrap()[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let gathered = {
            let slots = self.shared.usize_slots.lock().unwrap();
            slots.iter().flatten().copied().collect()
        };
        // Nobody may redeposit until every rank has read.
        self.shared.barrier.wait();
        gathered
    }

    fn allgather_f64s(&self, local: &[f64]) -> Vec<f64> {
        self.shared.f64_slots.lock().unwrap()[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let gathered = {
            let slots = self.shared.f64_slots.lock().unwrap();
            slots.iter().flatten().copied().collect()
        };
        self.shared.barrier.wait();
        gathered
    }
}
