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

//! The subject/observer value-propagation layer.

use petgraph::graph::NodeIndex;

use crate::kernel::EventId;
use crate::specs::{IfRef, ProbeRef, VertexRef};

/// Subject id 0 marks the unused (default / moved-from) state. Live ids
/// start at 1 and are handed out by the simulation context.
pub const UNUSED_SUBJECT: u32 = 0;

/// An observable value producer: a name, a context-unique id, and the
/// insertion-ordered set of `(observer, out-value-id)` registrations.
#[derive(Debug)]
pub struct Subject {
    id: u32,
    name: String,
    observers: Vec<(ObserverId, u32)>,
}

impl Default for Subject {
    /// The unused state. Taking a subject out of a graph node with
    /// `std::mem::take` leaves this behind; it must never be notified.
    fn default() -> Self {
        Self {
            id: UNUSED_SUBJECT,
            name: String::new(),
            observers: Vec::new(),
        }
    }
}

impl Subject {
    pub(crate) fn new(id: u32, name: &str) -> Self {
        assert!(id != UNUSED_SUBJECT, "subject ids start at 1");
        Self {
            id,
            name: String::from(name),
            observers: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an observer for an out-going value. Registering the same
    /// `(observer, value)` pair twice is a no-op.
    pub fn register_observer(&mut self, obs: ObserverId, val_id: u32) {
        if self.observers.iter().any(|r| *r == (obs, val_id)) {
            return;
        }
        self.observers.push((obs, val_id));
    }

    /// Erase a registration; erasing an unknown pair is a no-op.
    pub fn erase_observer(&mut self, obs: ObserverId, val_id: u32) {
        if let Some(at) = self.observers.iter().position(|r| *r == (obs, val_id)) {
            self.observers.remove(at);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Observers registered for `val_id`, in registration order.
    pub(crate) fn matching(&self, val_id: u32) -> Vec<ObserverId> {
        assert!(
            self.id != UNUSED_SUBJECT,
            "notify on an unused (moved-from) subject"
        );
        self.observers
            .iter()
            .filter(|(_, v)| *v == val_id)
            .map(|(obs, _)| *obs)
            .collect()
    }
}

impl PartialEq for Subject {
    fn eq(&self, rhs: &Subject) -> bool {
        self.id == rhs.id
    }
}
impl Eq for Subject {}

/// Handle of an observer in the simulation arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) usize);

/// Where an observer writes what it receives.
///
/// Value-typed slots belong to plain observers; descriptor slots belong to
/// interconnect observers. The pairing is fixed when the observer is
/// created, which is the capacity check of the original design done once
/// at elaboration instead of per notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestSlot {
    /// A compute vertex input (typed value).
    Input { vertex: VertexRef, index: usize },
    /// An if-vertex condition (bool).
    Condition { branch: IfRef },
    /// A probe sample (typed value).
    Probe { probe: ProbeRef },
    /// An if-vertex inbound edge (descriptor).
    Inbound { branch: IfRef, index: usize },
    /// An if-vertex outbound write-back slot (descriptor).
    Outbound { branch: IfRef, index: usize },
    /// An interconnect transmit slot (descriptor).
    Transmit { unit: NodeIndex, slot: usize },
}

#[derive(Debug)]
pub(crate) enum ObserverKind {
    /// Copies the value into its destination slot.
    Plain,
    /// Stores a descriptor of the value instead of copying, and keeps a
    /// changed flag the consumer resets when it picks the value up.
    Interconnect { changed: bool },
}

#[derive(Debug)]
pub struct ObserverRecord {
    pub(crate) event: EventId,
    pub(crate) dest: DestSlot,
    pub(crate) kind: ObserverKind,
}

/// Maps the dense per-node observer ids of the building API onto arena
/// records. Ids count up from 0 and are never reused, so an id stays
/// valid for the life of the manager even across erasures.
#[derive(Debug, Default)]
pub struct ObserverManager {
    entries: Vec<Option<ObserverId>>,
}

impl ObserverManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, obs: ObserverId) -> u32 {
        self.entries.push(Some(obs));
        (self.entries.len() - 1) as u32
    }

    pub fn erase(&mut self, id: u32) {
        if let Some(entry) = self.entries.get_mut(id as usize) {
            *entry = None;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: u32) -> Option<ObserverId> {
        self.entries.get(id as usize).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_free_id(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, ObserverId)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, entry)| entry.map(|obs| (id as u32, obs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut subject = Subject::new(1, "s");
        let obs = ObserverId(0);
        subject.register_observer(obs, 0);
        subject.register_observer(obs, 0);
        assert_eq!(subject.observer_count(), 1);
        // same observer for a different value is a distinct registration
        subject.register_observer(obs, 1);
        assert_eq!(subject.observer_count(), 2);
    }

    #[test]
    fn test_erase_unknown_pair_is_a_noop() {
        let mut subject = Subject::new(1, "s");
        subject.register_observer(ObserverId(0), 0);
        subject.erase_observer(ObserverId(0), 7);
        subject.erase_observer(ObserverId(3), 0);
        assert_eq!(subject.observer_count(), 1);
        subject.erase_observer(ObserverId(0), 0);
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn test_taken_subject_is_unused() {
        let mut subject = Subject::new(5, "s");
        subject.register_observer(ObserverId(0), 0);
        let moved = std::mem::take(&mut subject);
        assert_eq!(moved.id(), 5);
        assert_eq!(moved.observer_count(), 1);
        assert_eq!(subject.id(), UNUSED_SUBJECT);
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    #[should_panic(expected = "unused")]
    fn test_notify_on_unused_subject_panics() {
        let subject = Subject::default();
        let _ = subject.matching(0);
    }

    #[test]
    fn test_manager_ids_are_dense_and_stable() {
        let mut mgr = ObserverManager::new();
        assert_eq!(mgr.add(ObserverId(10)), 0);
        assert_eq!(mgr.add(ObserverId(11)), 1);
        assert_eq!(mgr.add(ObserverId(12)), 2);
        assert_eq!(mgr.len(), 3);

        mgr.erase(1);
        assert_eq!(mgr.get(1), None);
        assert_eq!(mgr.get(2), Some(ObserverId(12)));
        assert_eq!(mgr.len(), 2);
        // no id reuse after erase
        assert_eq!(mgr.add(ObserverId(13)), 3);
        assert_eq!(mgr.next_free_id(), 4);

        let collected: Vec<_> = mgr.iter().collect();
        assert_eq!(
            collected,
            vec![
                (0, ObserverId(10)),
                (2, ObserverId(12)),
                (3, ObserverId(13))
            ]
        );

        mgr.clear();
        assert!(mgr.is_empty());
        assert_eq!(mgr.next_free_id(), 0);
    }
}
