// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The virtual-time kernel: events, AND-lists, tasks, and the delta-cycle
//! scheduler.
//!
//! Tasks are synchronous state machines. A resume step runs until the task
//! would block and returns a [`Wait`] token; the kernel parks the task on
//! the named event, AND-list, or timer and re-enters it when the condition
//! fires. This keeps the single-threaded cooperative contract without any
//! host threads: nothing interleaves between two suspension points.

use bitvec::prelude::*;
use log::trace;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use crate::specs::SimTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AndListId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

/// What a task does next after a resume step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Park until the event fires.
    Event(EventId),
    /// Park until every constituent of the AND-list has fired.
    All(AndListId),
    /// Park for a span of simulated time.
    Delay(SimTime),
    /// Never resume again.
    Halt,
}

struct EventState {
    name: String,
    waiters: Vec<TaskId>,
    /// AND-lists this event participates in, with the bit position the
    /// event occupies in each list's fired-bitmap.
    memberships: Vec<(AndListId, usize)>,
}

struct AndListState {
    events: Vec<EventId>,
    fired: BitVec,
    waiter: Option<TaskId>,
}

struct TaskState {
    name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wake {
    Event(EventId),
    Task(TaskId),
}

/// A future notification. The heap is a max-heap, so `Ord` is reversed:
/// the entry with the smallest `(at, seq)` is the greatest. `seq` keeps
/// same-time wake-ups in issue order, which makes runs deterministic.
#[derive(Debug, PartialEq, Eq)]
struct Pending {
    at: SimTime,
    seq: u64,
    wake: Wake,
}

impl Ord for Pending {
    fn cmp(&self, rhs: &Pending) -> Ordering {
        rhs.at
            .cmp(&self.at)
            .then_with(|| rhs.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, rhs: &Pending) -> Option<Ordering> {
        Some(self.cmp(rhs))
    }
}

pub struct Kernel {
    now: SimTime,
    events: Vec<EventState>,
    and_lists: Vec<AndListState>,
    tasks: Vec<TaskState>,
    pending: BinaryHeap<Pending>,
    runnable: VecDeque<TaskId>,
    next_delta: VecDeque<TaskId>,
    /// Zero-delay notifications issued during the current delta; they
    /// deliver at the delta boundary, so a task that parks later in the
    /// same delta still catches them.
    delta_events: Vec<EventId>,
    seq: u64,
    started: bool,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            events: Vec::new(),
            and_lists: Vec::new(),
            tasks: Vec::new(),
            pending: BinaryHeap::new(),
            runnable: VecDeque::new(),
            next_delta: VecDeque::new(),
            delta_events: Vec::new(),
            seq: 0,
            started: false,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn event_name(&self, ev: EventId) -> &str {
        &self.events[ev.0].name
    }

    pub fn task_name(&self, task: TaskId) -> &str {
        &self.tasks[task.0].name
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn add_event(&mut self, name: &str) -> EventId {
        self.events.push(EventState {
            name: String::from(name),
            waiters: Vec::new(),
            memberships: Vec::new(),
        });
        EventId(self.events.len() - 1)
    }

    pub(crate) fn add_and_list(&mut self) -> AndListId {
        self.and_lists.push(AndListState {
            events: Vec::new(),
            fired: BitVec::new(),
            waiter: None,
        });
        AndListId(self.and_lists.len() - 1)
    }

    /// Add a constituent event to an AND-list. Elaboration-time only.
    pub(crate) fn and_list_push(&mut self, list: AndListId, ev: EventId) {
        assert!(
            !self.started,
            "AND-list constituents may only be added before the kernel starts"
        );
        let bit = self.and_lists[list.0].events.len();
        self.and_lists[list.0].events.push(ev);
        self.and_lists[list.0].fired.push(false);
        self.events[ev.0].memberships.push((list, bit));
    }

    pub(crate) fn and_list_len(&self, list: AndListId) -> usize {
        self.and_lists[list.0].events.len()
    }

    pub(crate) fn add_task(&mut self, name: &str) -> TaskId {
        self.tasks.push(TaskState {
            name: String::from(name),
        });
        TaskId(self.tasks.len() - 1)
    }

    /// Schedule wake-ups for everything sensitive to `ev`.
    ///
    /// A zero delay delivers at the boundary of the current delta cycle,
    /// waking waiters in the next delta of the same timestamp; anything
    /// else goes through the pending heap. Events have no memory: a
    /// delivery that finds no waiter and no AND-list membership is lost.
    pub fn notify(&mut self, ev: EventId, delay: SimTime) {
        if delay.is_zero() {
            // repeated notifications within one delta collapse
            if !self.delta_events.contains(&ev) {
                self.delta_events.push(ev);
            }
        } else {
            let at = self.now + delay;
            let seq = self.seq;
            self.seq += 1;
            self.pending.push(Pending {
                at,
                seq,
                wake: Wake::Event(ev),
            });
        }
    }

    fn fire(&mut self, ev: EventId) {
        trace!("kernel: {} fires at {}", self.events[ev.0].name, self.now);
        let waiters = std::mem::take(&mut self.events[ev.0].waiters);
        for task in waiters {
            self.next_delta.push_back(task);
        }
        // Bits are sticky: they accumulate even while no task is waiting,
        // so an activation that lands during the owner's compute phase is
        // not lost.
        let memberships = self.events[ev.0].memberships.clone();
        for (list, bit) in memberships {
            let state = &mut self.and_lists[list.0];
            state.fired.set(bit, true);
            if state.fired.all() {
                if let Some(task) = state.waiter.take() {
                    state.fired.fill(false);
                    self.next_delta.push_back(task);
                }
            }
        }
    }

    /// Park a task on the wait token its resume step returned.
    pub(crate) fn park(&mut self, task: TaskId, wait: Wait) {
        match wait {
            Wait::Event(ev) => self.events[ev.0].waiters.push(task),
            Wait::All(list) => {
                let state = &mut self.and_lists[list.0];
                assert!(
                    state.waiter.is_none(),
                    "AND-list already has a waiting task"
                );
                // An empty AND-list never completes; a full bitmap from
                // fires during the unarmed window completes immediately.
                if !state.events.is_empty() && state.fired.all() {
                    state.fired.fill(false);
                    self.next_delta.push_back(task);
                } else {
                    state.waiter = Some(task);
                }
            }
            Wait::Delay(delay) => {
                if delay.is_zero() {
                    self.next_delta.push_back(task);
                } else {
                    let at = self.now + delay;
                    let seq = self.seq;
                    self.seq += 1;
                    self.pending.push(Pending {
                        at,
                        seq,
                        wake: Wake::Task(task),
                    });
                }
            }
            Wait::Halt => {}
        }
    }

    /// Next runnable task of the current timestamp. When the current
    /// delta has drained, pending zero-delay notifications deliver and
    /// the next delta is promoted.
    pub(crate) fn pop_runnable(&mut self) -> Option<TaskId> {
        if let Some(task) = self.runnable.pop_front() {
            return Some(task);
        }
        let fired = std::mem::take(&mut self.delta_events);
        for ev in fired {
            self.fire(ev);
        }
        if !self.next_delta.is_empty() {
            trace!(
                "kernel: delta cycle at {} with {} runnable",
                self.now,
                self.next_delta.len()
            );
            std::mem::swap(&mut self.runnable, &mut self.next_delta);
            return self.runnable.pop_front();
        }
        None
    }

    pub(crate) fn next_pending_time(&self) -> Option<SimTime> {
        self.pending.peek().map(|p| p.at)
    }

    /// Advance to the earliest pending notification, firing everything
    /// scheduled for that instant. Returns false when nothing is pending.
    pub(crate) fn advance(&mut self) -> bool {
        let head = match self.pending.pop() {
            Some(head) => head,
            None => return false,
        };
        assert!(head.at >= self.now, "time went backwards");
        self.now = head.at;
        trace!("kernel: advancing to {}", self.now);
        self.apply(head.wake);
        while self
            .pending
            .peek()
            .map(|p| p.at == self.now)
            .unwrap_or(false)
        {
            let wake = self.pending.pop().unwrap().wake;
            self.apply(wake);
        }
        true
    }

    fn apply(&mut self, wake: Wake) {
        match wake {
            Wake::Event(ev) => self.fire(ev),
            Wake::Task(task) => self.next_delta.push_back(task),
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
