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

//! Inter-unit communication: per-link serialization, transaction packing,
//! and routed delivery.

use std::collections::VecDeque;

use itertools::Itertools;
use log::{debug, info};
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::error::Error;
use crate::kernel::{EventId, Kernel, Wait};
use crate::payload::{Command, Payload, PayloadId, PayloadPool, ResponseStatus, RoutingInfo};
use crate::sim::{Simulation, TaskOwner};
use crate::specs::{NodeRef, SimTime, SubjectRef, ValueDesc};
use crate::subject::{DestSlot, ObserverKind, ObserverManager, ObserverRecord, Subject};

/// An edge of the unit topology: the local index of the outgoing link at
/// the source unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    index: usize,
}

impl Link {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Serializes access to one outgoing link. A link carries one transaction
/// at a time; concurrent requests queue in FIFO order.
#[derive(Debug, Default)]
pub struct LinkManager {
    used: bool,
    queue: VecDeque<EventId>,
}

impl LinkManager {
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Ask for the link. Returns true when the caller was queued; on false
    /// the link is taken and the caller may transmit immediately.
    pub(crate) fn request(&mut self, ev: EventId) -> bool {
        if self.used {
            self.queue.push_back(ev);
            true
        } else {
            self.used = true;
            false
        }
    }

    /// Hand the link to the next queued job (same-instant notification,
    /// link stays marked used) or mark it free. Returns true when a next
    /// job was woken.
    pub(crate) fn release(&mut self, kernel: &mut Kernel) -> bool {
        if let Some(ev) = self.queue.pop_front() {
            kernel.notify(ev, SimTime::ZERO);
            true
        } else {
            self.used = false;
            false
        }
    }
}

/// Mesh directions an outgoing link can point in. Units number their
/// links independently; the per-unit direction map translates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDirection {
    Up,
    Right,
    Down,
    Left,
}

impl LinkDirection {
    fn idx(self) -> usize {
        match self {
            LinkDirection::Up => 0,
            LinkDirection::Right => 1,
            LinkDirection::Down => 2,
            LinkDirection::Left => 3,
        }
    }
}

/// Per-transmit-observer routing parameters: which local link the
/// transaction leaves on, the relative hop counts, and the value id the
/// destination publishes on delivery.
#[derive(Clone, Copy, Debug)]
pub struct TransmissionData {
    pub out_link: usize,
    pub dx: i32,
    pub dy: i32,
    pub dest_value_id: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InterconnectConfig {
    pub request_delay: SimTime,
    pub response_delay: SimTime,
    pub routing_latency: SimTime,
}

/// Step a relative coordinate counter toward zero by the magnitude of
/// `step`.
pub(crate) fn change_coordinate(value: &mut i32, step: i32) {
    if *value < 0 {
        *value += step.abs();
    } else {
        *value -= step.abs();
    }
}

/// Where a payload goes next. Implementations consume hops from the
/// routing record; `None` means the payload has arrived.
pub trait RoutingPolicy {
    fn next_link(&self, routing: &mut RoutingInfo) -> Option<LinkDirection>;
}

/// Dimension-order routing: walk x to zero first, then y. Positive x
/// heads right, positive y heads up.
#[derive(Debug, Default)]
pub struct DimensionOrderRouting;

impl RoutingPolicy for DimensionOrderRouting {
    fn next_link(&self, routing: &mut RoutingInfo) -> Option<LinkDirection> {
        if routing.target_reached() {
            return None;
        }
        if routing.x() != 0 {
            let dir = if routing.x() > 0 {
                LinkDirection::Right
            } else {
                LinkDirection::Left
            };
            let mut x = routing.x();
            change_coordinate(&mut x, 1);
            routing.set_x(x);
            Some(dir)
        } else {
            let dir = if routing.y() > 0 {
                LinkDirection::Up
            } else {
                LinkDirection::Down
            };
            let mut y = routing.y();
            change_coordinate(&mut y, 1);
            routing.set_y(y);
            Some(dir)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum XmitPhase {
    Init,
    Idle,
    Arbitrate,
    Sending,
    Routing,
}

#[derive(Debug)]
pub(crate) struct XmitState {
    pub(crate) phase: XmitPhase,
    pub(crate) payload: Option<PayloadId>,
    pub(crate) at_unit: NodeIndex,
    pub(crate) out_link: usize,
}

/// The per-unit communication fabric: outgoing link managers, the
/// transmission look-up table, transmit slots fed by interconnect
/// observers, and the payload pool. Doubles as the subject that local
/// successors observe for values arriving from other units.
#[derive(Debug)]
pub struct Interconnect {
    pub(crate) subject: Subject,
    pub(crate) config: InterconnectConfig,
    pub(crate) links: Vec<LinkManager>,
    pub(crate) link_map: [Option<usize>; 4],
    pub(crate) table: Vec<TransmissionData>,
    pub(crate) slots: Vec<Option<ValueDesc>>,
    pub(crate) slot_events: Vec<EventId>,
    pub(crate) link_free_events: Vec<EventId>,
    pub(crate) states: Vec<XmitState>,
    pub(crate) transmit_obs: ObserverManager,
    pub(crate) pool: PayloadPool,
}

impl Interconnect {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn pool(&self) -> &PayloadPool {
        &self.pool
    }

    pub fn link(&self, index: usize) -> &LinkManager {
        &self.links[index]
    }
}

/// Validate a transaction the way the receiving side does. Invalid
/// payloads get a response status and are dropped by the caller; this is
/// the non-fatal corner of the error taxonomy.
pub(crate) fn validate_payload(name: &str, payload: &mut Payload) -> bool {
    if payload.data_length > payload.streaming_width {
        info!("{}: streaming width not implemented", name);
        payload.response = ResponseStatus::GenericError;
        return false;
    }
    if payload.byte_enable.is_some() {
        info!("{}: byte enable not implemented", name);
        payload.response = ResponseStatus::ByteEnableError;
        return false;
    }
    payload.response = ResponseStatus::Ok;
    true
}

impl Simulation {
    /// Connect two units with a directed link. `link_index` is the local
    /// numbering of the outgoing link at `src`.
    pub fn add_link(
        &mut self,
        src: NodeIndex,
        dst: NodeIndex,
        link_index: usize,
    ) -> petgraph::graph::EdgeIndex {
        self.topo.add_edge(src, dst, Link::new(link_index))
    }

    /// Give a unit an interconnect: `out_links` outgoing link managers and
    /// a direction map used by routing to translate mesh directions into
    /// local link indices.
    pub fn enable_interconnect(
        &mut self,
        unit: NodeIndex,
        config: InterconnectConfig,
        out_links: usize,
        directions: &[(LinkDirection, usize)],
    ) {
        let name = format!("{}_interconnect", self.topo[unit].name());
        let subject = Subject::new(self.alloc_subject_id(), &name);
        assert!(
            directions.iter().map(|(dir, _)| dir.idx()).all_unique(),
            "{}: duplicate direction in link map",
            name
        );
        let mut link_map = [None; 4];
        for (dir, index) in directions {
            link_map[dir.idx()] = Some(*index);
        }
        let mut links = Vec::new();
        links.resize_with(out_links, LinkManager::default);
        self.topo[unit].interconnect = Some(Interconnect {
            subject,
            config,
            links,
            link_map,
            table: Vec::new(),
            slots: Vec::new(),
            slot_events: Vec::new(),
            link_free_events: Vec::new(),
            states: Vec::new(),
            transmit_obs: ObserverManager::new(),
            pool: PayloadPool::new(&format!("{}_payloads", name)),
        });
    }

    pub fn interconnect(&self, unit: NodeIndex) -> Option<&Interconnect> {
        self.topo[unit].interconnect.as_ref()
    }

    /// Route out-value `val_id` of `src` over the interconnect of `unit`.
    /// Creates a transmit slot with its observer and serving task; the
    /// observer hands the interconnect a descriptor of the value rather
    /// than a copy.
    pub fn add_transmit(
        &mut self,
        src: SubjectRef,
        val_id: u32,
        unit: NodeIndex,
        tdata: TransmissionData,
    ) -> Result<usize, Error> {
        {
            let ic = self.topo[unit]
                .interconnect
                .as_ref()
                .ok_or(Error::InterconnectMissing(unit))?;
            if tdata.out_link >= ic.links.len() {
                return Err(Error::UnknownLink(unit, tdata.out_link));
            }
        }
        let name = String::from(
            self.topo[unit]
                .interconnect
                .as_ref()
                .unwrap()
                .subject
                .name(),
        );
        let slot = self.topo[unit].interconnect.as_ref().unwrap().slots.len();
        let slot_ev = self.kernel.add_event(&format!("{}_txEv{}", name, slot));
        let free_ev = self
            .kernel
            .add_event(&format!("{}_txLinkFreeEv{}", name, slot));
        let observer = self.add_observer(ObserverRecord {
            event: slot_ev,
            dest: DestSlot::Transmit { unit, slot },
            kind: ObserverKind::Interconnect { changed: false },
        });
        self.spawn_task(
            &format!("{}_transmit{}", name, slot),
            TaskOwner::Transmit { unit, slot },
        );

        let ic = self.topo[unit].interconnect.as_mut().unwrap();
        ic.slots.push(None);
        ic.slot_events.push(slot_ev);
        ic.link_free_events.push(free_ev);
        ic.table.push(tdata);
        ic.states.push(XmitState {
            phase: XmitPhase::Init,
            payload: None,
            at_unit: unit,
            out_link: tdata.out_link,
        });
        ic.transmit_obs.add(observer);

        self.subject_mut(src).register_observer(observer, val_id);
        Ok(slot)
    }

    /// Bind a local observer to values the unit's interconnect delivers
    /// for `dest_value_id`.
    pub fn connect_from_interconnect(
        &mut self,
        unit: NodeIndex,
        dst: NodeRef,
        obs_id: u32,
        dest_value_id: u32,
    ) -> Result<(), Error> {
        if self.topo[unit].interconnect.is_none() {
            return Err(Error::InterconnectMissing(unit));
        }
        let observer = self
            .node_observer(dst, obs_id)
            .ok_or(Error::UnknownObserver(obs_id))?;
        self.topo[unit]
            .interconnect
            .as_mut()
            .unwrap()
            .subject
            .register_observer(observer, dest_value_id);
        Ok(())
    }

    /// One resume step of a transmit task: pick up a changed slot, pack a
    /// payload, win the out link, occupy it for the request and response
    /// delays, then walk the route and deliver.
    pub(crate) fn resume_transmit(&mut self, unit: NodeIndex, slot: usize) -> Wait {
        loop {
            let phase = self.topo[unit].interconnect.as_ref().unwrap().states[slot].phase;
            match phase {
                XmitPhase::Init => {
                    let ic = self.topo[unit].interconnect.as_mut().unwrap();
                    ic.states[slot].phase = XmitPhase::Idle;
                    return Wait::Event(ic.slot_events[slot]);
                }
                XmitPhase::Idle => {
                    let obs = self.topo[unit].interconnect.as_ref().unwrap()
                        .transmit_obs
                        .get(slot as u32)
                        .unwrap();
                    if !self.observer_value_changed(obs, true) {
                        let ic = self.topo[unit].interconnect.as_ref().unwrap();
                        return Wait::Event(ic.slot_events[slot]);
                    }
                    let ic = self.topo[unit].interconnect.as_mut().unwrap();
                    let desc = ic.slots[slot].unwrap_or_else(|| {
                        panic!(
                            "{}: transmit slot {} notified without data",
                            ic.subject.name(),
                            slot
                        )
                    });
                    let tdata = ic.table[slot];
                    let payload = ic.pool.allocate();
                    let p = ic.pool.get_mut(payload);
                    p.command = Command::Read;
                    p.address = tdata.dest_value_id as u64;
                    p.data = Some(desc);
                    p.data_length = desc.bytes;
                    p.streaming_width = desc.bytes;
                    p.routing.set_coordinates(tdata.dx, tdata.dy);
                    ic.states[slot] = XmitState {
                        phase: XmitPhase::Idle,
                        payload: Some(payload),
                        at_unit: unit,
                        out_link: tdata.out_link,
                    };
                    debug!(
                        "{}: transaction for value {} on link {} at {}",
                        ic.subject.name(),
                        tdata.dest_value_id,
                        tdata.out_link,
                        self.kernel.now()
                    );
                    let free_ev = ic.link_free_events[slot];
                    let queued = ic.links[tdata.out_link].request(free_ev);
                    if queued {
                        ic.states[slot].phase = XmitPhase::Arbitrate;
                        return Wait::Event(free_ev);
                    }
                    ic.states[slot].phase = XmitPhase::Sending;
                    return Wait::Delay(ic.config.request_delay + ic.config.response_delay);
                }
                XmitPhase::Arbitrate => {
                    // the releasing job handed us the link already marked used
                    let ic = self.topo[unit].interconnect.as_mut().unwrap();
                    ic.states[slot].phase = XmitPhase::Sending;
                    return Wait::Delay(ic.config.request_delay + ic.config.response_delay);
                }
                XmitPhase::Sending => {
                    let out_link = self.topo[unit].interconnect.as_ref().unwrap().states[slot]
                        .out_link;
                    let node = self.topo.node_weight_mut(unit).unwrap();
                    let ic = node.interconnect.as_mut().unwrap();
                    ic.links[out_link].release(&mut self.kernel);
                    ic.states[slot].phase = XmitPhase::Routing;
                }
                XmitPhase::Routing => {
                    let (payload, at_unit) = {
                        let state = &self.topo[unit].interconnect.as_ref().unwrap().states[slot];
                        (state.payload.unwrap(), state.at_unit)
                    };
                    let mut routing = self.topo[unit]
                        .interconnect
                        .as_ref()
                        .unwrap()
                        .pool
                        .get(payload)
                        .routing;
                    let dir = self.routing.next_link(&mut routing);
                    {
                        let ic = self.topo[unit].interconnect.as_mut().unwrap();
                        ic.pool.get_mut(payload).routing = routing;
                    }
                    match dir {
                        None => {
                            self.deliver(unit, slot, payload, at_unit);
                            let ic = self.topo[unit].interconnect.as_mut().unwrap();
                            ic.pool.release(payload);
                            ic.states[slot].payload = None;
                            ic.states[slot].phase = XmitPhase::Idle;
                            ic.states[slot].at_unit = unit;
                            // fall through to Idle: a publish that landed
                            // mid-flight left the changed flag set
                        }
                        Some(dir) => {
                            let link = self.topo[at_unit]
                                .interconnect
                                .as_ref()
                                .unwrap_or_else(|| {
                                    panic!(
                                        "{}: routing through a unit without interconnect",
                                        self.topo[at_unit].name()
                                    )
                                })
                                .link_map[dir.idx()]
                                .unwrap_or_else(|| {
                                    panic!(
                                        "{}: no link {:?} for routing",
                                        self.topo[at_unit].name(),
                                        dir
                                    )
                                });
                            let next = self
                                .topo
                                .edges(at_unit)
                                .find(|e| e.weight().index() == link)
                                .map(|e| e.target())
                                .unwrap_or_else(|| {
                                    panic!(
                                        "{}: out link {} leads nowhere",
                                        self.topo[at_unit].name(),
                                        link
                                    )
                                });
                            let ic = self.topo[unit].interconnect.as_mut().unwrap();
                            ic.states[slot].at_unit = next;
                            return Wait::Delay(ic.config.routing_latency);
                        }
                    }
                }
            }
        }
    }

    /// Validate the payload at the target unit and, when it is well
    /// formed, publish its data through the target interconnect's subject.
    fn deliver(&mut self, origin: NodeIndex, slot: usize, payload: PayloadId, target: NodeIndex) {
        let origin_name = String::from(
            self.topo[origin]
                .interconnect
                .as_ref()
                .unwrap()
                .subject
                .name(),
        );
        let (valid, address, desc) = {
            let p = self.topo[origin]
                .interconnect
                .as_mut()
                .unwrap()
                .pool
                .get_mut(payload);
            let valid = validate_payload(&origin_name, p);
            (valid, p.address as u32, p.data)
        };
        if !valid {
            debug!(
                "{}: transaction from slot {} dropped at {}",
                origin_name,
                slot,
                self.kernel.now()
            );
            return;
        }
        let target_ic = self.topo[target].interconnect.as_ref().unwrap_or_else(|| {
            panic!(
                "{}: delivery to a unit without interconnect",
                self.topo[target].name()
            )
        });
        let name = String::from(target_ic.subject.name());
        let matching = target_ic.subject.matching(address);
        let desc = desc.expect("packed payload without data");
        self.fanout(&name, &matching, desc);
    }
}
