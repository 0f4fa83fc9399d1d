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

//! The simulation context: graph storage, the build API, task dispatch,
//! and the run loop.

use log::trace;
use petgraph::graph::{Graph, NodeIndex};

use crate::error::Error;
use crate::ifvertex::{IfVertex, PathKind};
use crate::interconnect::{DimensionOrderRouting, Link, RoutingPolicy};
use crate::kernel::{Kernel, TaskId, Wait};
use crate::specs::{
    IfRef, NodeRef, ProbeRef, SimTime, SourceRef, SubjectRef, Value, ValueDesc, ValueSlot,
    ValueType, VertexRef,
};
use crate::subject::{DestSlot, ObserverId, ObserverKind, ObserverRecord, Subject};
use crate::unit::ProcessingUnit;
use crate::vertex::{ComputeVertex, VERTEX_OUTPUTS};

/// Which state machine a kernel task re-enters.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TaskOwner {
    Vertex(VertexRef),
    IfDispatch(IfRef),
    IfJoin(IfRef, PathKind),
    Source(SourceRef),
    Transmit { unit: NodeIndex, slot: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourcePhase {
    Init,
    Armed,
}

/// A test/driver stimulus: a subject that publishes one value at a chosen
/// simulated time.
#[derive(Debug)]
pub struct SourceState {
    pub(crate) subject: Subject,
    pub(crate) value: Value,
    pub(crate) at: SimTime,
    phase: SourcePhase,
}

impl SourceState {
    pub fn name(&self) -> &str {
        self.subject.name()
    }

    pub fn value(&self) -> Value {
        self.value
    }
}

/// Records every value delivered to it together with the simulated time
/// of delivery.
#[derive(Debug)]
pub struct ProbeState {
    name: String,
    pub(crate) ty: ValueType,
    pub(crate) samples: Vec<(SimTime, Value)>,
}

impl ProbeState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[(SimTime, Value)] {
        &self.samples
    }

    pub fn last(&self) -> Option<(SimTime, Value)> {
        self.samples.last().copied()
    }
}

/// Owns the kernel, the unit topology, and every graph node. All
/// elaboration goes through this context, which also hands out the
/// monotonic subject ids (a fresh context restarts them at 1).
pub struct Simulation {
    pub(crate) kernel: Kernel,
    pub(crate) topo: Graph<ProcessingUnit, Link>,
    pub(crate) vertices: Vec<ComputeVertex>,
    pub(crate) ifs: Vec<IfVertex>,
    pub(crate) sources: Vec<SourceState>,
    pub(crate) probes: Vec<ProbeState>,
    pub(crate) observers: Vec<ObserverRecord>,
    pub(crate) owners: Vec<TaskOwner>,
    pub(crate) routing: Box<dyn RoutingPolicy>,
    next_subject_id: u32,
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            kernel: Kernel::new(),
            topo: Graph::new(),
            vertices: Vec::new(),
            ifs: Vec::new(),
            sources: Vec::new(),
            probes: Vec::new(),
            observers: Vec::new(),
            owners: Vec::new(),
            routing: Box::new(DimensionOrderRouting),
            next_subject_id: 1,
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn now(&self) -> SimTime {
        self.kernel.now()
    }

    /// Swap in the routing policy of the simulated network.
    pub fn set_routing_policy(&mut self, policy: Box<dyn RoutingPolicy>) {
        self.routing = policy;
    }

    pub(crate) fn alloc_subject_id(&mut self) -> u32 {
        let id = self.next_subject_id;
        self.next_subject_id += 1;
        id
    }

    pub fn add_unit(&mut self, name: &str, unit_id: u32) -> NodeIndex {
        self.topo.add_node(ProcessingUnit::new(name, unit_id))
    }

    pub fn unit(&self, unit: NodeIndex) -> &ProcessingUnit {
        &self.topo[unit]
    }

    pub(crate) fn spawn_task(&mut self, name: &str, owner: TaskOwner) -> TaskId {
        let task = self.kernel.add_task(name);
        assert_eq!(task.0, self.owners.len());
        self.owners.push(owner);
        task
    }

    pub(crate) fn add_observer(&mut self, record: ObserverRecord) -> ObserverId {
        self.observers.push(record);
        ObserverId(self.observers.len() - 1)
    }

    /// Read-and-optionally-reset the changed flag of an interconnect-kind
    /// observer.
    pub(crate) fn observer_value_changed(&mut self, obs: ObserverId, reset: bool) -> bool {
        match &mut self.observers[obs.0].kind {
            ObserverKind::Interconnect { changed } => {
                let was = *changed;
                if was && reset {
                    *changed = false;
                }
                was
            }
            ObserverKind::Plain => panic!("value-changed query on a plain observer"),
        }
    }

    /// Add a stimulus that publishes `value` on its out-value 0 at time
    /// `at`.
    pub fn add_source(&mut self, name: &str, value: Value, at: SimTime) -> SourceRef {
        let source = SourceRef(self.sources.len());
        let subject = Subject::new(self.alloc_subject_id(), name);
        self.spawn_task(&format!("{}_stimulus", name), TaskOwner::Source(source));
        self.sources.push(SourceState {
            subject,
            value,
            at,
            phase: SourcePhase::Init,
        });
        source
    }

    pub fn source(&self, source: SourceRef) -> &SourceState {
        &self.sources[source.0]
    }

    /// Replace a stimulus value before the run. The type is part of the
    /// elaborated graph and must not change.
    pub fn set_source_value(&mut self, source: SourceRef, value: Value) {
        let state = &mut self.sources[source.0];
        assert_eq!(
            state.value.ty(),
            value.ty(),
            "{}: stimulus type changed after elaboration",
            state.subject.name()
        );
        state.value = value;
    }

    /// Attach a recording probe to out-value `val_id` of a subject.
    pub fn add_probe(
        &mut self,
        name: &str,
        src: SubjectRef,
        val_id: u32,
        ty: ValueType,
    ) -> Result<ProbeRef, Error> {
        if let Some(found) = self.subject_out_type(src, val_id) {
            if found != ty {
                return Err(Error::TypeMismatch {
                    expected: ty,
                    found,
                });
            }
        }
        let probe = ProbeRef(self.probes.len());
        let event = self.kernel.add_event(&format!("{}Ev", name));
        let obs = self.add_observer(ObserverRecord {
            event,
            dest: DestSlot::Probe { probe },
            kind: ObserverKind::Plain,
        });
        self.subject_mut(src).register_observer(obs, val_id);
        self.probes.push(ProbeState {
            name: String::from(name),
            ty,
            samples: Vec::new(),
        });
        Ok(probe)
    }

    pub fn probe(&self, probe: ProbeRef) -> &ProbeState {
        &self.probes[probe.0]
    }

    /// Bind observer `obs_id` of `dst` onto out-value `val_id` of `src`.
    /// Where both value types are statically known they must agree.
    pub fn connect(
        &mut self,
        src: SubjectRef,
        dst: NodeRef,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        if let SubjectRef::Vertex(_) = src {
            if val_id >= VERTEX_OUTPUTS {
                return Err(Error::InvalidValueId(val_id));
            }
        }
        let observer = self
            .node_observer(dst, obs_id)
            .ok_or(Error::UnknownObserver(obs_id))?;
        if let Some(expected) = self.observer_value_type(observer) {
            if let Some(found) = self.subject_out_type(src, val_id) {
                if expected != found {
                    return Err(Error::TypeMismatch { expected, found });
                }
            }
        }
        self.subject_mut(src).register_observer(observer, val_id);
        Ok(())
    }

    /// Symmetric to [`Simulation::connect`].
    pub fn disconnect(
        &mut self,
        src: SubjectRef,
        dst: NodeRef,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        let observer = self
            .node_observer(dst, obs_id)
            .ok_or(Error::UnknownObserver(obs_id))?;
        self.subject_mut(src).erase_observer(observer, val_id);
        Ok(())
    }

    pub fn subject_id(&self, subject: SubjectRef) -> u32 {
        self.subject_ref(subject).id()
    }

    pub fn subject_name(&self, subject: SubjectRef) -> &str {
        self.subject_ref(subject).name()
    }

    fn subject_ref(&self, subject: SubjectRef) -> &Subject {
        match subject {
            SubjectRef::Vertex(v) => &self.vertices[v.0].subject,
            SubjectRef::If(i) => &self.ifs[i.0].subject,
            SubjectRef::ThenPath(i) => &self.ifs[i.0].paths[PathKind::Then.idx()].subject,
            SubjectRef::ElsePath(i) => &self.ifs[i.0].paths[PathKind::Else.idx()].subject,
            SubjectRef::Source(s) => &self.sources[s.0].subject,
            SubjectRef::Interconnect(u) => {
                &self.topo[u]
                    .interconnect
                    .as_ref()
                    .unwrap_or_else(|| {
                        panic!("{}: unit has no interconnect", self.topo[u].name())
                    })
                    .subject
            }
        }
    }

    pub(crate) fn subject_mut(&mut self, subject: SubjectRef) -> &mut Subject {
        match subject {
            SubjectRef::Vertex(v) => &mut self.vertices[v.0].subject,
            SubjectRef::If(i) => &mut self.ifs[i.0].subject,
            SubjectRef::ThenPath(i) => &mut self.ifs[i.0].paths[PathKind::Then.idx()].subject,
            SubjectRef::ElsePath(i) => &mut self.ifs[i.0].paths[PathKind::Else.idx()].subject,
            SubjectRef::Source(s) => &mut self.sources[s.0].subject,
            SubjectRef::Interconnect(u) => {
                let name = String::from(self.topo[u].name());
                &mut self.topo[u]
                    .interconnect
                    .as_mut()
                    .unwrap_or_else(|| panic!("{}: unit has no interconnect", name))
                    .subject
            }
        }
    }

    pub(crate) fn node_subject_mut(&mut self, node: NodeRef) -> &mut Subject {
        match node {
            NodeRef::Vertex(v) => &mut self.vertices[v.0].subject,
            NodeRef::If(i) => &mut self.ifs[i.0].subject,
        }
    }

    pub(crate) fn node_observer(&self, node: NodeRef, obs_id: u32) -> Option<ObserverId> {
        match node {
            NodeRef::Vertex(v) => self.vertices[v.0].input_obs.get(obs_id),
            NodeRef::If(i) => self.ifs[i.0].input_obs.get(obs_id),
        }
    }

    /// The value type published on `val_id`, when statically known.
    /// If-vertices and interconnects forward descriptors of other nodes'
    /// storage, so their output types resolve only at run time.
    pub(crate) fn subject_out_type(&self, subject: SubjectRef, val_id: u32) -> Option<ValueType> {
        match subject {
            SubjectRef::Vertex(v) if val_id < VERTEX_OUTPUTS => {
                Some(self.vertices[v.0].output_type)
            }
            SubjectRef::Source(s) if val_id == 0 => Some(self.sources[s.0].value.ty()),
            _ => None,
        }
    }

    /// The value type a plain observer's destination slot accepts;
    /// descriptor slots have none.
    fn observer_value_type(&self, obs: ObserverId) -> Option<ValueType> {
        match self.observers[obs.0].dest {
            DestSlot::Input { vertex, index } => Some(self.vertices[vertex.0].input_types[index]),
            DestSlot::Condition { .. } => Some(ValueType::Bool),
            DestSlot::Probe { probe } => Some(self.probes[probe.0].ty),
            _ => None,
        }
    }

    /// Resolve a descriptor to the value currently in its slot.
    pub(crate) fn read_slot(&self, slot: ValueSlot) -> Value {
        match slot {
            ValueSlot::VertexOut { vertex } => self.vertices[vertex.0].output.1,
            ValueSlot::Source { source } => self.sources[source.0].value,
        }
    }

    /// Deliver a published value to a set of observers, same-delta.
    pub(crate) fn fanout(&mut self, src_name: &str, matching: &[ObserverId], desc: ValueDesc) {
        for obs in matching {
            self.notify_observer(src_name, *obs, SimTime::ZERO, desc);
        }
    }

    /// One observer notification: copy the value (plain) or store the
    /// descriptor (interconnect), then schedule the trigger event.
    pub(crate) fn notify_observer(
        &mut self,
        src_name: &str,
        obs: ObserverId,
        delay: SimTime,
        desc: ValueDesc,
    ) {
        let event = self.observers[obs.0].event;
        let dest = self.observers[obs.0].dest;
        let plain = matches!(self.observers[obs.0].kind, ObserverKind::Plain);
        if plain {
            let value = self.read_slot(desc.slot);
            match dest {
                DestSlot::Input { vertex, index } => {
                    let state = &mut self.vertices[vertex.0];
                    assert_eq!(
                        value.ty(),
                        state.input_types[index],
                        "{}: input {} of {} expects {}",
                        src_name,
                        index,
                        state.subject.name(),
                        state.input_types[index]
                    );
                    state.inputs[index] = value;
                }
                DestSlot::Condition { branch } => match value {
                    Value::Bool(b) => self.ifs[branch.0].condition = b,
                    other => panic!(
                        "{}: condition of {} expects bool, got {}",
                        src_name,
                        self.ifs[branch.0].subject.name(),
                        other.ty()
                    ),
                },
                DestSlot::Probe { probe } => {
                    let now = self.kernel.now();
                    let state = &mut self.probes[probe.0];
                    assert_eq!(
                        value.ty(),
                        state.ty,
                        "{}: probe {} expects {}",
                        src_name,
                        state.name,
                        state.ty
                    );
                    state.samples.push((now, value));
                }
                _ => panic!("{}: plain observer bound to a descriptor slot", src_name),
            }
        } else {
            if let ObserverKind::Interconnect { changed } = &mut self.observers[obs.0].kind {
                *changed = true;
            }
            match dest {
                DestSlot::Inbound { branch, index } => {
                    self.ifs[branch.0].inbound[index] = Some(desc);
                }
                DestSlot::Outbound { branch, index } => {
                    self.ifs[branch.0].outbound[index] = Some(desc);
                }
                DestSlot::Transmit { unit, slot } => {
                    self.topo[unit]
                        .interconnect
                        .as_mut()
                        .unwrap()
                        .slots[slot] = Some(desc);
                }
                _ => panic!(
                    "{}: interconnect observer bound to a value slot",
                    src_name
                ),
            }
        }
        self.kernel.notify(event, delay);
    }

    fn resume_source(&mut self, source: SourceRef) -> Wait {
        match self.sources[source.0].phase {
            SourcePhase::Init => {
                self.sources[source.0].phase = SourcePhase::Armed;
                Wait::Delay(self.sources[source.0].at)
            }
            SourcePhase::Armed => {
                let state = &self.sources[source.0];
                let desc = ValueDesc {
                    slot: ValueSlot::Source { source },
                    bytes: state.value.ty().size_bytes(),
                };
                let name = String::from(state.subject.name());
                let matching = state.subject.matching(0);
                trace!("{}: publishing {} at {}", name, state.value, self.kernel.now());
                self.fanout(&name, &matching, desc);
                Wait::Halt
            }
        }
    }

    fn resume(&mut self, task: TaskId) {
        let owner = self.owners[task.0];
        let wait = match owner {
            TaskOwner::Vertex(v) => self.resume_vertex(v),
            TaskOwner::IfDispatch(i) => self.resume_if_dispatch(i),
            TaskOwner::IfJoin(i, path) => self.resume_if_join(i, path),
            TaskOwner::Source(s) => self.resume_source(s),
            TaskOwner::Transmit { unit, slot } => self.resume_transmit(unit, slot),
        };
        self.kernel.park(task, wait);
    }

    /// Run the simulation until the pending-event heap drains, or past the
    /// optional time bound. Returns the final simulated time.
    ///
    /// The first call resumes every task once, in registration order,
    /// within delta 0 of time 0; that is where each task arms its first
    /// wait, before any notification is delivered.
    pub fn run(&mut self, until: Option<SimTime>) -> SimTime {
        if !self.kernel.started() {
            self.kernel.mark_started();
            trace!("simulation: initializing {} tasks", self.kernel.task_count());
            for index in 0..self.owners.len() {
                self.resume(TaskId(index));
            }
        }
        loop {
            while let Some(task) = self.kernel.pop_runnable() {
                self.resume(task);
            }
            match self.kernel.next_pending_time() {
                None => break,
                Some(at) if until.map_or(false, |bound| at > bound) => break,
                Some(_) => {
                    self.kernel.advance();
                }
            }
        }
        self.kernel.now()
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconnect::{InterconnectConfig, LinkDirection, TransmissionData};
    use crate::vertex::{OpKind, VertexConfig};
    use crate::IfConfig;
    use itertools::Itertools;

    fn ns(t: u64) -> SimTime {
        SimTime::from_ns(t)
    }

    #[test]
    fn test_subject_ids_are_unique_and_restart_per_context() {
        let mut sim = Simulation::new();
        let s1 = sim.add_source("s1", Value::U8(1), ns(0));
        let s2 = sim.add_source("s2", Value::U8(2), ns(0));
        let unit = sim.add_unit("u0", 0);
        let v = sim
            .add_vertex(unit, 1, VertexConfig::new("v", OpKind::Add))
            .unwrap();
        let ids = vec![
            sim.subject_id(SubjectRef::Source(s1)),
            sim.subject_id(SubjectRef::Source(s2)),
            sim.subject_id(SubjectRef::Vertex(v)),
        ];
        assert!(ids.iter().all_unique());
        assert!(ids.iter().all(|id| *id >= 1));

        let mut fresh = Simulation::new();
        let s = fresh.add_source("s", Value::U8(0), ns(0));
        assert_eq!(fresh.subject_id(SubjectRef::Source(s)), 1);
    }

    #[test]
    fn test_two_input_and() {
        let _logger = env_logger::builder().try_init();
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let s1 = sim.add_source("s1", Value::U8(0xF0), ns(0));
        let s2 = sim.add_source("s2", Value::U8(0x0F), ns(0));
        let v = sim
            .add_vertex(
                unit,
                1,
                VertexConfig::new("and0", OpKind::BitAnd)
                    .types(&[ValueType::U8, ValueType::U8], ValueType::U8)
                    .latency(ns(5)),
            )
            .unwrap();
        sim.connect(SubjectRef::Source(s1), NodeRef::Vertex(v), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s2), NodeRef::Vertex(v), 1, 0)
            .unwrap();
        let probe = sim
            .add_probe("and0_out", SubjectRef::Vertex(v), 0, ValueType::U8)
            .unwrap();

        sim.run(None);
        assert_eq!(sim.probe(probe).last(), Some((ns(5), Value::U8(0x00))));
        assert_eq!(sim.vertex(v).result(), Value::U8(0x00));
        assert!(!sim.unit(unit).core_used());
    }

    #[test]
    fn test_arbitration_serializes_same_unit_vertices() {
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let s1 = sim.add_source("s1", Value::U32(1), ns(0));
        let s2 = sim.add_source("s2", Value::U32(2), ns(0));
        let s3 = sim.add_source("s3", Value::U32(3), ns(0));
        let v1 = sim
            .add_vertex(
                unit,
                1,
                VertexConfig::new("add1", OpKind::Add).latency(ns(10)),
            )
            .unwrap();
        let v2 = sim
            .add_vertex(
                unit,
                2,
                VertexConfig::new("add2", OpKind::Add).latency(ns(10)),
            )
            .unwrap();
        sim.connect(SubjectRef::Source(s1), NodeRef::Vertex(v1), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s2), NodeRef::Vertex(v1), 1, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s2), NodeRef::Vertex(v2), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s3), NodeRef::Vertex(v2), 1, 0)
            .unwrap();
        let p1 = sim
            .add_probe("add1_out", SubjectRef::Vertex(v1), 0, ValueType::U32)
            .unwrap();
        let p2 = sim
            .add_probe("add2_out", SubjectRef::Vertex(v2), 0, ValueType::U32)
            .unwrap();

        sim.run(None);
        assert_eq!(sim.probe(p1).last(), Some((ns(10), Value::U32(3))));
        assert_eq!(sim.probe(p2).last(), Some((ns(20), Value::U32(5))));
    }

    #[test]
    fn test_latency_attributed_to_each_holder() {
        // differing latencies: the second holder starts when the first
        // one's cost has elapsed and pays its own on top
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let s = sim.add_source("s", Value::U32(4), ns(0));
        let v1 = sim
            .add_vertex(
                unit,
                1,
                VertexConfig::new("inc", OpKind::PostInc)
                    .types(&[ValueType::U32], ValueType::U32)
                    .latency(ns(7)),
            )
            .unwrap();
        let v2 = sim
            .add_vertex(
                unit,
                2,
                VertexConfig::new("dec", OpKind::PostDec)
                    .types(&[ValueType::U32], ValueType::U32)
                    .latency(ns(3)),
            )
            .unwrap();
        sim.connect(SubjectRef::Source(s), NodeRef::Vertex(v1), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s), NodeRef::Vertex(v2), 0, 0)
            .unwrap();
        let p1 = sim
            .add_probe("inc_out", SubjectRef::Vertex(v1), 0, ValueType::U32)
            .unwrap();
        let p2 = sim
            .add_probe("dec_out", SubjectRef::Vertex(v2), 0, ValueType::U32)
            .unwrap();

        sim.run(None);
        assert_eq!(sim.probe(p1).last(), Some((ns(7), Value::U32(4))));
        assert_eq!(sim.probe(p2).last(), Some((ns(10), Value::U32(4))));
    }

    fn build_if_fixture(condition: bool) -> (Simulation, IfRef) {
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let a = sim.add_source("a", Value::U32(7), ns(0));
        let b = sim.add_source("b", Value::U32(11), ns(0));
        let cond = sim.add_source("cond", Value::Bool(condition), ns(0));
        let branch = sim
            .add_if_vertex(
                unit,
                1,
                IfConfig::new("if0", 2, SubjectRef::Source(cond)),
            )
            .unwrap();
        sim.connect(SubjectRef::Source(a), NodeRef::If(branch), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(b), NodeRef::If(branch), 1, 0)
            .unwrap();
        (sim, branch)
    }

    #[test]
    fn test_if_passthrough_publishes_at_condition_time() {
        let (mut sim, branch) = build_if_fixture(true);
        let p0 = sim
            .add_probe("if_out0", SubjectRef::If(branch), 0, ValueType::U32)
            .unwrap();
        let p1 = sim
            .add_probe("if_out1", SubjectRef::If(branch), 1, ValueType::U32)
            .unwrap();

        sim.run(None);
        assert_eq!(sim.probe(p0).samples(), &[(ns(0), Value::U32(7))]);
        assert_eq!(sim.probe(p1).samples(), &[(ns(0), Value::U32(11))]);
    }

    #[test]
    fn test_if_then_write_back_replaces_one_slot() {
        let (mut sim, branch) = build_if_fixture(true);
        sim.add_vertex_to_then(
            branch,
            10,
            VertexConfig::new("p", OpKind::PostDec)
                .types(&[ValueType::U32], ValueType::U32)
                .latency(ns(2)),
        )
        .unwrap();
        sim.connect_to_then_dependency(branch, 10, 0, 0).unwrap();
        sim.register_then_out_dependency(branch, 10, 0, 0).unwrap();
        let p0 = sim
            .add_probe("if_out0", SubjectRef::If(branch), 0, ValueType::U32)
            .unwrap();
        let p1 = sim
            .add_probe("if_out1", SubjectRef::If(branch), 1, ValueType::U32)
            .unwrap();

        sim.run(None);
        // PostDec returns the pre-decrement value; slot 1 passes through.
        // Each external output is published exactly once per activation.
        assert_eq!(sim.probe(p0).samples(), &[(ns(2), Value::U32(7))]);
        assert_eq!(sim.probe(p1).samples(), &[(ns(2), Value::U32(11))]);
        assert_eq!(sim.if_vertex(branch).write_back_observers().len(), 1);
    }

    #[test]
    fn test_condition_false_activates_only_else_path() {
        let (mut sim, branch) = build_if_fixture(false);
        let p_then = sim
            .add_vertex_to_then(
                branch,
                10,
                VertexConfig::new("p", OpKind::PostDec)
                    .types(&[ValueType::U32], ValueType::U32)
                    .latency(ns(2)),
            )
            .unwrap();
        sim.connect_to_then_dependency(branch, 10, 0, 0).unwrap();
        sim.register_then_out_dependency(branch, 10, 0, 0).unwrap();
        // same inbound value may feed both arms
        let q_else = sim
            .add_vertex_to_else(
                branch,
                20,
                VertexConfig::new("q", OpKind::PostInc)
                    .types(&[ValueType::U32], ValueType::U32)
                    .latency(ns(3)),
            )
            .unwrap();
        sim.connect_to_else_dependency(branch, 20, 0, 0).unwrap();
        sim.register_else_out_dependency(branch, 20, 0, 0).unwrap();
        let p0 = sim
            .add_probe("if_out0", SubjectRef::If(branch), 0, ValueType::U32)
            .unwrap();

        sim.run(None);
        // only the else path ran: publish carries its latency, the
        // then-path vertex never computed
        assert_eq!(sim.probe(p0).samples(), &[(ns(3), Value::U32(7))]);
        assert_eq!(sim.vertex(q_else).result(), Value::U32(7));
        assert_eq!(sim.vertex(p_then).result(), Value::U32(0));
        assert!(!sim.if_vertex(branch).condition());
    }

    #[test]
    fn test_if_inbound_observers_store_descriptors() {
        let (mut sim, branch) = build_if_fixture(true);
        sim.run(None);
        let state = sim.if_vertex(branch);
        assert_eq!(state.in_edges(), 2);
        assert_eq!(state.condition_observers().len(), 1);
        // inbound slots hold descriptors of the source storage, not copies
        let desc = sim.ifs[branch.index()].inbound[0].unwrap();
        assert!(matches!(desc.slot, ValueSlot::Source { .. }));
        assert_eq!(desc.bytes, 4);
        // the changed flag reads true once and can be reset
        let obs = sim.ifs[branch.index()].input_obs.get(0).unwrap();
        assert!(sim.observer_value_changed(obs, true));
        assert!(!sim.observer_value_changed(obs, false));
    }

    #[test]
    fn test_structural_errors_are_reported() {
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let cond = sim.add_source("cond", Value::Bool(true), ns(0));
        let not_bool = sim.add_source("n", Value::U32(1), ns(0));
        sim.add_vertex(unit, 1, VertexConfig::new("v", OpKind::Add))
            .unwrap();

        assert_eq!(
            sim.add_vertex(unit, 1, VertexConfig::new("dup", OpKind::Add)),
            Err(Error::DuplicateVertex(unit, 1))
        );
        assert!(matches!(
            sim.add_vertex(
                unit,
                2,
                VertexConfig::new("bad", OpKind::Add).types(&[ValueType::U32], ValueType::U32)
            ),
            Err(Error::BadArity { .. })
        ));
        assert!(matches!(
            sim.add_if_vertex(unit, 3, IfConfig::new("if0", 1, SubjectRef::Source(not_bool))),
            Err(Error::TypeMismatch { .. })
        ));

        let branch = sim
            .add_if_vertex(unit, 4, IfConfig::new("if1", 1, SubjectRef::Source(cond)))
            .unwrap();
        assert_eq!(
            sim.connect_to_then_dependency(branch, 99, 0, 0),
            Err(Error::UnknownPathNode(PathKind::Then, 99))
        );
        sim.add_vertex_to_then(
            branch,
            10,
            VertexConfig::new("t", OpKind::Assign).types(&[ValueType::U32], ValueType::U32),
        )
        .unwrap();
        assert_eq!(
            sim.add_vertex_to_then(branch, 10, VertexConfig::new("t2", OpKind::Assign)),
            Err(Error::DuplicatePathVertex(PathKind::Then, 10))
        );
        assert_eq!(
            sim.connect_to_then_dependency(branch, 10, 0, 5),
            Err(Error::InvalidEdge(5, 1))
        );
        assert_eq!(
            sim.register_then_out_dependency(branch, 11, 0, 0),
            Err(Error::UnknownPathNode(PathKind::Then, 11))
        );
        assert_eq!(
            sim.connect_to_then_dependency(branch, 10, 7, 0),
            Err(Error::UnknownObserver(7))
        );
        assert!(sim.then_path_node(branch, 10).is_ok());
        assert_eq!(
            sim.else_path_node(branch, 10),
            Err(Error::UnknownPathNode(PathKind::Else, 10))
        );
    }

    #[test]
    fn test_connect_rejects_type_mismatch() {
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let s = sim.add_source("s", Value::U8(1), ns(0));
        let v = sim
            .add_vertex(unit, 1, VertexConfig::new("v", OpKind::Add))
            .unwrap();
        assert_eq!(
            sim.connect(SubjectRef::Source(s), NodeRef::Vertex(v), 0, 0),
            Err(Error::TypeMismatch {
                expected: ValueType::U32,
                found: ValueType::U8
            })
        );
        let w = sim
            .add_vertex(unit, 2, VertexConfig::new("w", OpKind::Add))
            .unwrap();
        assert_eq!(
            sim.connect(SubjectRef::Vertex(w), NodeRef::Vertex(v), 0, 3),
            Err(Error::InvalidValueId(3))
        );
    }

    #[test]
    fn test_disconnect_is_symmetric_to_connect() {
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let s = sim.add_source("s", Value::U32(1), ns(0));
        let held = sim.add_source("h", Value::U32(2), ns(0));
        let v = sim
            .add_vertex(unit, 1, VertexConfig::new("v", OpKind::Add))
            .unwrap();
        sim.connect(SubjectRef::Source(s), NodeRef::Vertex(v), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(held), NodeRef::Vertex(v), 1, 0)
            .unwrap();
        // connect twice leaves a single registration
        sim.connect(SubjectRef::Source(s), NodeRef::Vertex(v), 0, 0)
            .unwrap();
        assert_eq!(sim.sources[0].subject.observer_count(), 1);
        sim.disconnect(SubjectRef::Source(s), NodeRef::Vertex(v), 0, 0)
            .unwrap();
        assert_eq!(sim.sources[0].subject.observer_count(), 0);
    }

    #[test]
    fn test_interconnect_serializes_one_link() {
        let _logger = env_logger::builder().try_init();
        let mut sim = Simulation::new();
        let u1 = sim.add_unit("u1", 1);
        let u2 = sim.add_unit("u2", 2);
        sim.add_link(u1, u2, 0);
        let config = InterconnectConfig {
            request_delay: ns(3),
            response_delay: ns(2),
            routing_latency: ns(1),
        };
        sim.enable_interconnect(u1, config, 1, &[(LinkDirection::Right, 0)]);
        sim.enable_interconnect(u2, InterconnectConfig::default(), 0, &[]);

        let s1 = sim.add_source("s1", Value::U32(5), ns(0));
        let s2 = sim.add_source("s2", Value::U32(9), ns(0));
        let v1 = sim
            .add_vertex(
                u1,
                1,
                VertexConfig::new("v1", OpKind::Assign).types(&[ValueType::U32], ValueType::U32),
            )
            .unwrap();
        let v2 = sim
            .add_vertex(
                u1,
                2,
                VertexConfig::new("v2", OpKind::Assign).types(&[ValueType::U32], ValueType::U32),
            )
            .unwrap();
        sim.connect(SubjectRef::Source(s1), NodeRef::Vertex(v1), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s2), NodeRef::Vertex(v2), 0, 0)
            .unwrap();

        sim.add_transmit(
            SubjectRef::Vertex(v1),
            0,
            u1,
            TransmissionData {
                out_link: 0,
                dx: 1,
                dy: 0,
                dest_value_id: 0,
            },
        )
        .unwrap();
        sim.add_transmit(
            SubjectRef::Vertex(v2),
            0,
            u1,
            TransmissionData {
                out_link: 0,
                dx: 1,
                dy: 0,
                dest_value_id: 1,
            },
        )
        .unwrap();
        let p1 = sim
            .add_probe("u2_val0", SubjectRef::Interconnect(u2), 0, ValueType::U32)
            .unwrap();
        let p2 = sim
            .add_probe("u2_val1", SubjectRef::Interconnect(u2), 1, ValueType::U32)
            .unwrap();

        sim.run(None);
        // first transaction: request+response (5 ns) then one hop (1 ns);
        // the second only wins the link once the first releases it at 5 ns
        assert_eq!(sim.probe(p1).last(), Some((ns(6), Value::U32(5))));
        assert_eq!(sim.probe(p2).last(), Some((ns(11), Value::U32(9))));

        // both payloads returned to the pool
        let pool = sim.interconnect(u1).unwrap().pool();
        assert_eq!(pool.free_count(), pool.total_count());
        assert!(pool.total_count() >= 2);
        assert!(!sim.interconnect(u1).unwrap().link(0).is_used());
    }

    #[test]
    fn test_transmit_requires_interconnect_and_valid_link() {
        let mut sim = Simulation::new();
        let u1 = sim.add_unit("u1", 1);
        let s = sim.add_source("s", Value::U32(5), ns(0));
        let tdata = TransmissionData {
            out_link: 0,
            dx: 1,
            dy: 0,
            dest_value_id: 0,
        };
        assert_eq!(
            sim.add_transmit(SubjectRef::Source(s), 0, u1, tdata),
            Err(Error::InterconnectMissing(u1))
        );
        sim.enable_interconnect(u1, InterconnectConfig::default(), 1, &[]);
        let bad = TransmissionData {
            out_link: 4,
            ..tdata
        };
        assert_eq!(
            sim.add_transmit(SubjectRef::Source(s), 0, u1, bad),
            Err(Error::UnknownLink(u1, 4))
        );
        assert!(sim.add_transmit(SubjectRef::Source(s), 0, u1, tdata).is_ok());
    }

    #[test]
    fn test_run_honors_time_bound() {
        let mut sim = Simulation::new();
        let unit = sim.add_unit("u0", 0);
        let s1 = sim.add_source("s1", Value::U32(1), ns(0));
        let s2 = sim.add_source("s2", Value::U32(2), ns(20));
        let v = sim
            .add_vertex(unit, 1, VertexConfig::new("v", OpKind::Add).latency(ns(1)))
            .unwrap();
        sim.connect(SubjectRef::Source(s1), NodeRef::Vertex(v), 0, 0)
            .unwrap();
        sim.connect(SubjectRef::Source(s2), NodeRef::Vertex(v), 1, 0)
            .unwrap();
        let probe = sim
            .add_probe("v_out", SubjectRef::Vertex(v), 0, ValueType::U32)
            .unwrap();

        let stopped = sim.run(Some(ns(10)));
        assert!(stopped <= ns(10));
        assert!(sim.probe(probe).samples().is_empty());

        sim.run(None);
        assert_eq!(sim.probe(probe).last(), Some((ns(21), Value::U32(3))));
    }
}
