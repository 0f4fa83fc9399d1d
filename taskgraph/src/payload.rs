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

//! Pooled transaction objects for the interconnect.

use log::warn;

use crate::specs::ValueDesc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Command {
    #[default]
    Ignore,
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseStatus {
    #[default]
    Incomplete,
    Ok,
    GenericError,
    ByteEnableError,
}

/// Remaining hops of a routed payload, as relative coordinate counters.
/// The target is reached when both counters are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingInfo {
    x: i32,
    y: i32,
}

impl RoutingInfo {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn coordinates(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }

    pub fn set_coordinates(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    pub fn set_x(&mut self, x: i32) {
        self.x = x;
    }

    pub fn set_y(&mut self, y: i32) {
        self.y = y;
    }

    pub fn clear(&mut self) {
        self.x = 0;
        self.y = 0;
    }

    pub fn target_reached(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

/// An inter-unit message. Carries a descriptor of the source data rather
/// than a copy; the receiver resolves the descriptor on delivery.
#[derive(Debug, Default)]
pub struct Payload {
    pub command: Command,
    pub address: u64,
    pub data: Option<ValueDesc>,
    pub data_length: usize,
    pub byte_enable: Option<Vec<bool>>,
    pub streaming_width: usize,
    pub dmi_allowed: bool,
    pub response: ResponseStatus,
    pub routing: RoutingInfo,
    ref_count: u32,
}

impl Payload {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn reset(&mut self) {
        self.command = Command::Ignore;
        self.address = 0;
        self.data = None;
        self.data_length = 0;
        self.byte_enable = None;
        self.streaming_width = 0;
        self.dmi_allowed = false;
        self.response = ResponseStatus::Incomplete;
        self.routing.clear();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PayloadId(usize);

/// Free-list allocator for transaction objects.
///
/// Constructing payloads per message would dominate interconnect cost, so
/// released objects are reset to defaults and recycled. Objects are
/// reference counted; `release` returns them to the free list when the
/// last reference goes away.
#[derive(Debug)]
pub struct PayloadPool {
    name: String,
    payloads: Vec<Payload>,
    free: Vec<PayloadId>,
}

impl PayloadPool {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            payloads: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allocate(&mut self) -> PayloadId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.payloads.push(Payload::default());
                PayloadId(self.payloads.len() - 1)
            }
        };
        self.payloads[id.0].ref_count = 1;
        id
    }

    pub fn acquire(&mut self, id: PayloadId) {
        let payload = &mut self.payloads[id.0];
        assert!(payload.ref_count > 0, "{}: acquire of a freed payload", self.name);
        payload.ref_count += 1;
    }

    pub fn release(&mut self, id: PayloadId) {
        let payload = &mut self.payloads[id.0];
        assert!(payload.ref_count > 0, "{}: release of a freed payload", self.name);
        payload.ref_count -= 1;
        if payload.ref_count == 0 {
            payload.reset();
            self.free.push(id);
        }
    }

    pub fn get(&self, id: PayloadId) -> &Payload {
        &self.payloads[id.0]
    }

    pub fn get_mut(&mut self, id: PayloadId) -> &mut Payload {
        &mut self.payloads[id.0]
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn total_count(&self) -> usize {
        self.payloads.len()
    }
}

impl Drop for PayloadPool {
    fn drop(&mut self) {
        let in_use = self.payloads.iter().filter(|p| p.ref_count > 0).count();
        if in_use > 0 {
            warn!(
                "{}: {} payload object(s) still in use at shutdown",
                self.name, in_use
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::{ValueSlot, VertexRef};

    #[test]
    fn test_allocate_recycles_released_objects() {
        let mut pool = PayloadPool::new("pool");
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        assert_eq!(pool.total_count(), 2);

        pool.release(a);
        assert_eq!(pool.free_count(), 1);
        let c = pool.allocate();
        assert_eq!(c, a);
        assert_eq!(pool.total_count(), 2);
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn test_release_resets_all_fields() {
        let mut pool = PayloadPool::new("pool");
        let id = pool.allocate();
        {
            let p = pool.get_mut(id);
            p.command = Command::Read;
            p.address = 42;
            p.data = Some(ValueDesc {
                slot: ValueSlot::VertexOut {
                    vertex: VertexRef(0),
                },
                bytes: 4,
            });
            p.data_length = 4;
            p.streaming_width = 4;
            p.dmi_allowed = true;
            p.response = ResponseStatus::Ok;
            p.routing.set_coordinates(2, -1);
        }
        pool.release(id);
        let again = pool.allocate();
        assert_eq!(again, id);
        let p = pool.get(again);
        assert_eq!(p.command, Command::Ignore);
        assert_eq!(p.address, 0);
        assert_eq!(p.data, None);
        assert_eq!(p.data_length, 0);
        assert_eq!(p.streaming_width, 0);
        assert!(!p.dmi_allowed);
        assert_eq!(p.response, ResponseStatus::Incomplete);
        assert!(p.routing.target_reached());
        pool.release(again);
    }

    #[test]
    fn test_free_list_never_exceeds_total() {
        let mut pool = PayloadPool::new("pool");
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.allocate());
        }
        for id in held {
            pool.release(id);
        }
        assert!(pool.free_count() <= pool.total_count());
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_reference_counting_defers_recycling() {
        let mut pool = PayloadPool::new("pool");
        let id = pool.allocate();
        pool.acquire(id);
        pool.release(id);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.get(id).ref_count(), 1);
        pool.release(id);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_routing_target() {
        let mut routing = RoutingInfo::new(1, 0);
        assert!(!routing.target_reached());
        routing.set_x(0);
        assert!(routing.target_reached());
        routing.set_coordinates(0, -2);
        assert!(!routing.target_reached());
        routing.clear();
        assert!(routing.target_reached());
    }
}
