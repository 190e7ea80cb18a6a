// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Deferred commit/abort callbacks.
//!
//! Ordering is the whole contract here: commit tasks run in forward
//! registration order once the outermost transaction commits, abort tasks
//! run in reverse registration order when any transaction aborts, and a
//! nested commit concatenates the child's tasks after the parent's so both
//! orders survive the merge.

type Task = Box<dyn FnOnce()>;

struct Slot {
    key: Option<usize>,
    run: Task,
}

/// An append-only list of deferred callbacks, optionally keyed for
/// structured push/pop deregistration.
#[derive(Default)]
pub struct TaskList {
    slots: Vec<Slot>,
}

impl TaskList {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, task: impl FnOnce() + 'static) {
        self.slots.push(Slot {
            key: None,
            run: Box::new(task),
        });
    }

    /// Registers a task that can later be withdrawn with [`TaskList::pop_keyed`].
    pub fn push_keyed(&mut self, key: usize, task: impl FnOnce() + 'static) {
        self.slots.push(Slot {
            key: Some(key),
            run: Box::new(task),
        });
    }

    /// Withdraws (without running) the most recently registered task under
    /// `key`. Returns false if no task with that key is pending.
    pub fn pop_keyed(&mut self, key: usize) -> bool {
        if let Some(index) = self.slots.iter().rposition(|s| s.key == Some(key)) {
            self.slots.remove(index);
            true
        } else {
            false
        }
    }

    /// Runs every task in registration order, consuming the list.
    pub fn run_forward(&mut self) {
        for slot in self.slots.drain(..) {
            (slot.run)();
        }
    }

    /// Runs every task in reverse registration order, consuming the list.
    pub fn run_reverse(&mut self) {
        while let Some(slot) = self.slots.pop() {
            (slot.run)();
        }
    }

    /// Drops all pending tasks without running them.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Moves `other`'s tasks to the end of this list, preserving both
    /// lists' internal order.
    pub fn append(&mut self, other: &mut TaskList) {
        self.slots.append(&mut other.slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce()>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let seen = seen.clone();
            move |tag: u32| -> Box<dyn FnOnce()> {
                let seen = seen.clone();
                Box::new(move || seen.borrow_mut().push(tag))
            }
        };
        (seen, make)
    }

    #[test]
    fn test_forward_and_reverse_order() {
        let (seen, make) = recorder();
        let mut list = TaskList::new();
        list.push(make(1));
        list.push(make(2));
        list.push(make(3));
        list.run_forward();
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert!(list.is_empty());

        let (seen, make) = recorder();
        let mut list = TaskList::new();
        list.push(make(1));
        list.push(make(2));
        list.push(make(3));
        list.run_reverse();
        assert_eq!(*seen.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_pop_keyed_removes_most_recent() {
        let (seen, make) = recorder();
        let mut list = TaskList::new();
        list.push_keyed(7, make(1));
        list.push(make(2));
        list.push_keyed(7, make(3));

        assert!(list.pop_keyed(7));
        assert!(list.pop_keyed(7));
        assert!(!list.pop_keyed(7));

        list.run_forward();
        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn test_append_preserves_order() {
        let (seen, make) = recorder();
        let mut parent = TaskList::new();
        let mut child = TaskList::new();
        parent.push(make(1));
        child.push(make(2));
        child.push(make(3));
        parent.append(&mut child);
        assert!(child.is_empty());

        parent.run_reverse();
        assert_eq!(*seen.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn test_clear_drops_without_running() {
        let (seen, make) = recorder();
        let mut list = TaskList::new();
        list.push(make(1));
        list.clear();
        list.run_forward();
        assert!(seen.borrow().is_empty());
    }
}
