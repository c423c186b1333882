//! Sequencing of asynchronous operation results.
//!
//! Operations on the underlying node implementations may complete
//! later, identified by a sequence number. The work queue parks the
//! continuation under `(owner, seq)` until the matching completion
//! arrives. Destroying the owner cancels its parked work; cancelled
//! continuations never run.

use std::cell::RefCell;

#[cfg(test)]
mod tests;

/// Identifies the object a work item belongs to.
pub type WorkOwner = u64;

struct WorkItem {
    owner: WorkOwner,
    seq: u32,
    func: Box<dyn FnOnce(i32)>,
}

#[derive(Default)]
pub struct WorkQueue {
    items: RefCell<Vec<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `func` until [`WorkQueue::complete`] is called with the
    /// same key.
    pub fn add(&self, owner: WorkOwner, seq: u32, func: impl FnOnce(i32) + 'static) {
        self.items.borrow_mut().push(WorkItem {
            owner,
            seq,
            func: Box::new(func),
        });
    }

    /// Routes a completion to its continuation. Returns whether a
    /// continuation was found.
    pub fn complete(&self, owner: WorkOwner, seq: u32, res: i32) -> bool {
        let item = {
            let mut items = self.items.borrow_mut();
            let Some(pos) = items
                .iter()
                .position(|i| i.owner == owner && i.seq == seq)
            else {
                return false;
            };
            items.remove(pos)
        };
        (item.func)(res);
        true
    }

    /// Drops every continuation parked by `owner`.
    pub fn cancel(&self, owner: WorkOwner) {
        self.items.borrow_mut().retain(|i| i.owner != owner);
    }

    pub fn has_pending(&self, owner: WorkOwner) -> bool {
        self.items.borrow().iter().any(|i| i.owner == owner)
    }
}
