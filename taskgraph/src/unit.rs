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

//! Processing units: the simulated execution resources vertices arbitrate
//! for.

use std::collections::{BTreeMap, VecDeque};

use crate::interconnect::Interconnect;
use crate::kernel::{EventId, Kernel};
use crate::specs::{NodeRef, SimTime};

/// A single sequential core with a waiting queue.
///
/// At most one vertex holds the core at any simulated instant; concurrent
/// execution requests queue up and are granted in FIFO order. The
/// `core_used` flag is true exactly while some task owns the core or a
/// wake-up is in flight to the next owner.
#[derive(Debug)]
pub struct ProcessingUnit {
    name: String,
    unit_id: u32,
    core_used: bool,
    waiters: VecDeque<EventId>,
    vertices: BTreeMap<u32, NodeRef>,
    pub(crate) interconnect: Option<Interconnect>,
}

impl ProcessingUnit {
    pub(crate) fn new(name: &str, unit_id: u32) -> Self {
        Self {
            name: String::from(name),
            unit_id,
            core_used: false,
            waiters: VecDeque::new(),
            vertices: BTreeMap::new(),
            interconnect: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_id(&self) -> u32 {
        self.unit_id
    }

    pub fn core_used(&self) -> bool {
        self.core_used
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn vertex(&self, id: u32) -> Option<NodeRef> {
        self.vertices.get(&id).copied()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Returns false when the id is already taken.
    pub(crate) fn insert_vertex(&mut self, id: u32, node: NodeRef) -> bool {
        if self.vertices.contains_key(&id) {
            return false;
        }
        self.vertices.insert(id, node);
        true
    }

    /// Ask for the core. If it is free the requester's event fires this
    /// delta and the core is taken; otherwise the event queues behind the
    /// current holder.
    pub(crate) fn request_core(&mut self, kernel: &mut Kernel, ev: EventId) {
        if self.core_used {
            self.waiters.push_back(ev);
        } else {
            self.core_used = true;
            kernel.notify(ev, SimTime::ZERO);
        }
    }

    /// Give the core up after computing. A queued waiter is woken once the
    /// releasing vertex's latency has elapsed and the flag stays set for
    /// it; with nobody waiting the core goes idle. The releasing task
    /// consumes its own latency with a delay of its own in both cases.
    pub(crate) fn release_core(&mut self, kernel: &mut Kernel, latency: SimTime) {
        if let Some(ev) = self.waiters.pop_front() {
            kernel.notify(ev, latency);
        } else {
            self.core_used = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_core_grants_immediately() {
        let mut kernel = Kernel::new();
        let mut unit = ProcessingUnit::new("u0", 0);
        let ev = kernel.add_event("coreFreeEv");
        let t = kernel.add_task("t");
        kernel.park(t, crate::kernel::Wait::Event(ev));

        unit.request_core(&mut kernel, ev);
        assert!(unit.core_used());
        assert_eq!(unit.waiting(), 0);
        assert_eq!(kernel.pop_runnable(), Some(t));
    }

    #[test]
    fn test_busy_core_queues_requests_in_order() {
        let mut kernel = Kernel::new();
        let mut unit = ProcessingUnit::new("u0", 0);
        let e1 = kernel.add_event("e1");
        let e2 = kernel.add_event("e2");
        let e3 = kernel.add_event("e3");

        unit.request_core(&mut kernel, e1);
        unit.request_core(&mut kernel, e2);
        unit.request_core(&mut kernel, e3);
        assert_eq!(unit.waiting(), 2);

        // handing off keeps the flag set for the next holder
        unit.release_core(&mut kernel, SimTime::from_ns(4));
        assert!(unit.core_used());
        assert_eq!(unit.waiting(), 1);
        assert_eq!(kernel.next_pending_time(), Some(SimTime::from_ns(4)));

        unit.release_core(&mut kernel, SimTime::from_ns(2));
        assert!(unit.core_used());
        assert_eq!(unit.waiting(), 0);

        unit.release_core(&mut kernel, SimTime::from_ns(1));
        assert!(!unit.core_used());
    }

    #[test]
    fn test_duplicate_vertex_id_is_rejected() {
        let mut unit = ProcessingUnit::new("u0", 0);
        let node = NodeRef::Vertex(crate::specs::VertexRef(0));
        assert!(unit.insert_vertex(3, node));
        assert!(!unit.insert_vertex(3, node));
        assert_eq!(unit.vertex_count(), 1);
        assert_eq!(unit.vertex(3), Some(node));
        assert_eq!(unit.vertex(4), None);
    }
}
