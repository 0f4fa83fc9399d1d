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

//! Hierarchical if-then-else vertices.
//!
//! An if-vertex gates notification down one of two sub-graphs based on a
//! runtime condition and re-joins its external successors once the chosen
//! path has produced every registered write-back. Data crosses the vertex
//! as descriptors: unchanged values pass through by reference, and a
//! write-back merely redirects an outbound slot at the sub-vertex that
//! produced the replacement.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::debug;
use petgraph::graph::NodeIndex;

use crate::error::Error;
use crate::kernel::{AndListId, Wait};
use crate::sim::{Simulation, TaskOwner};
use crate::specs::{IfRef, NodeRef, SimTime, SubjectRef, ValueDesc, ValueType, VertexRef};
use crate::subject::{DestSlot, ObserverKind, ObserverManager, ObserverRecord, Subject};
use crate::vertex::VertexConfig;
use crate::Color;

/// Which arm of an if-vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathKind {
    Then,
    Else,
}

impl PathKind {
    pub(crate) fn idx(self) -> usize {
        match self {
            PathKind::Then => 0,
            PathKind::Else => 1,
        }
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathKind::Then => "then".fmt(f),
            PathKind::Else => "else".fmt(f),
        }
    }
}

/// One arm of the if: its own subject (the inbound hook sub-vertices
/// register on) and the vertices placed inside the arm.
#[derive(Debug)]
pub(crate) struct SubPath {
    pub(crate) subject: Subject,
    pub(crate) vertices: BTreeMap<u32, NodeRef>,
}

/// Parameters of an if-vertex.
#[derive(Clone, Debug)]
pub struct IfConfig {
    pub name: String,
    pub color: Color,
    pub latency: SimTime,
    /// Incoming data edges, condition excluded.
    pub in_edges: usize,
    /// The subject whose out-value 0 carries the 1-bit condition.
    pub condition: SubjectRef,
}

impl IfConfig {
    pub fn new(name: &str, in_edges: usize, condition: SubjectRef) -> Self {
        Self {
            name: String::from(name),
            color: 0,
            latency: SimTime::ZERO,
            in_edges,
            condition,
        }
    }
}

#[derive(Debug)]
pub struct IfVertex {
    pub(crate) subject: Subject,
    pub(crate) number: u32,
    pub(crate) color: Color,
    pub(crate) latency: SimTime,
    pub(crate) unit: NodeIndex,
    /// Last delivered condition value.
    pub(crate) condition: bool,
    pub(crate) condition_obs: ObserverManager,
    /// Inbound observers, one per incoming data edge.
    pub(crate) input_obs: ObserverManager,
    /// Write-back observers created by out-dependency registration.
    pub(crate) end_obs: ObserverManager,
    pub(crate) inbound: Vec<Option<ValueDesc>>,
    pub(crate) outbound: Vec<Option<ValueDesc>>,
    pub(crate) begin_list: AndListId,
    pub(crate) paths: [SubPath; 2],
    pub(crate) join_lists: [AndListId; 2],
    /// Inbound value ids to re-notify into each arm on activation.
    pub(crate) node_sets: [BTreeSet<u32>; 2],
    pub(crate) join_event_count: usize,
    pub(crate) dispatch_armed: bool,
    pub(crate) join_armed: [bool; 2],
}

impl IfVertex {
    pub fn name(&self) -> &str {
        self.subject.name()
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn latency(&self) -> SimTime {
        self.latency
    }

    pub fn in_edges(&self) -> usize {
        self.inbound.len()
    }

    pub fn condition(&self) -> bool {
        self.condition
    }

    pub fn condition_observers(&self) -> &ObserverManager {
        &self.condition_obs
    }

    pub fn write_back_observers(&self) -> &ObserverManager {
        &self.end_obs
    }

    fn path(&self, path: PathKind) -> &SubPath {
        &self.paths[path.idx()]
    }
}

impl Simulation {
    /// Add an if-vertex to a processing unit. The condition observer is
    /// registered automatically on out-value 0 of the condition subject.
    pub fn add_if_vertex(
        &mut self,
        unit: NodeIndex,
        id: u32,
        config: IfConfig,
    ) -> Result<IfRef, Error> {
        if self.topo[unit].vertex(id).is_some() {
            return Err(Error::DuplicateVertex(unit, id));
        }
        let branch = self.build_if_vertex(unit, id, config)?;
        assert!(self.topo[unit].insert_vertex(id, NodeRef::If(branch)));
        Ok(branch)
    }

    pub(crate) fn build_if_vertex(
        &mut self,
        unit: NodeIndex,
        id: u32,
        config: IfConfig,
    ) -> Result<IfRef, Error> {
        // A condition is one bit; reject anything else that is statically
        // known.
        if let Some(found) = self.subject_out_type(config.condition, 0) {
            if found != ValueType::Bool {
                return Err(Error::TypeMismatch {
                    expected: ValueType::Bool,
                    found,
                });
            }
        }

        let branch = IfRef(self.ifs.len());
        let subject = Subject::new(self.alloc_subject_id(), &config.name);
        let then_subject =
            Subject::new(self.alloc_subject_id(), &format!("{}_thenPath", config.name));
        let else_subject =
            Subject::new(self.alloc_subject_id(), &format!("{}_elsePath", config.name));

        // Condition observer, registered right away.
        let cond_event = self
            .kernel
            .add_event(&format!("{}_conditionEv", config.name));
        let cond_obs = self.add_observer(ObserverRecord {
            event: cond_event,
            dest: DestSlot::Condition { branch },
            kind: ObserverKind::Plain,
        });
        let mut condition_obs = ObserverManager::new();
        condition_obs.add(cond_obs);

        // Inbound descriptor observers, one per data edge, each feeding
        // the activation AND-list.
        let begin_list = self.kernel.add_and_list();
        let mut input_obs = ObserverManager::new();
        for index in 0..config.in_edges {
            let ev = self
                .kernel
                .add_event(&format!("{}_inEdgeEv{}", config.name, index));
            self.kernel.and_list_push(begin_list, ev);
            let obs = self.add_observer(ObserverRecord {
                event: ev,
                dest: DestSlot::Inbound { branch, index },
                kind: ObserverKind::Interconnect { changed: false },
            });
            input_obs.add(obs);
        }
        self.kernel.and_list_push(begin_list, cond_event);

        let join_lists = [self.kernel.add_and_list(), self.kernel.add_and_list()];
        self.spawn_task(
            &format!("{}_conditionCheck", config.name),
            TaskOwner::IfDispatch(branch),
        );
        self.spawn_task(
            &format!("{}_ifEndFromThen", config.name),
            TaskOwner::IfJoin(branch, PathKind::Then),
        );
        self.spawn_task(
            &format!("{}_ifEndFromElse", config.name),
            TaskOwner::IfJoin(branch, PathKind::Else),
        );

        self.ifs.push(IfVertex {
            subject,
            number: id,
            color: config.color,
            latency: config.latency,
            unit,
            condition: false,
            condition_obs,
            input_obs,
            end_obs: ObserverManager::new(),
            inbound: vec![None; config.in_edges],
            outbound: vec![None; config.in_edges],
            begin_list,
            paths: [
                SubPath {
                    subject: then_subject,
                    vertices: BTreeMap::new(),
                },
                SubPath {
                    subject: else_subject,
                    vertices: BTreeMap::new(),
                },
            ],
            join_lists,
            node_sets: [BTreeSet::new(), BTreeSet::new()],
            join_event_count: 0,
            dispatch_armed: false,
            join_armed: [false, false],
        });

        self.subject_mut(config.condition)
            .register_observer(cond_obs, 0);
        Ok(branch)
    }

    pub fn if_vertex(&self, branch: IfRef) -> &IfVertex {
        &self.ifs[branch.0]
    }

    pub fn add_vertex_to_then(
        &mut self,
        branch: IfRef,
        id: u32,
        config: VertexConfig,
    ) -> Result<VertexRef, Error> {
        self.add_path_vertex(branch, PathKind::Then, id, config)
    }

    pub fn add_vertex_to_else(
        &mut self,
        branch: IfRef,
        id: u32,
        config: VertexConfig,
    ) -> Result<VertexRef, Error> {
        self.add_path_vertex(branch, PathKind::Else, id, config)
    }

    fn add_path_vertex(
        &mut self,
        branch: IfRef,
        path: PathKind,
        id: u32,
        config: VertexConfig,
    ) -> Result<VertexRef, Error> {
        if self.ifs[branch.0].path(path).vertices.contains_key(&id) {
            return Err(Error::DuplicatePathVertex(path, id));
        }
        let unit = self.ifs[branch.0].unit;
        let vertex = self.build_vertex(unit, id, config)?;
        self.ifs[branch.0].paths[path.idx()]
            .vertices
            .insert(id, NodeRef::Vertex(vertex));
        Ok(vertex)
    }

    /// Nest another if-vertex inside an arm. The nested vertex arbitrates
    /// on the same processing unit as its parent.
    pub fn add_if_vertex_to_then(
        &mut self,
        branch: IfRef,
        id: u32,
        config: IfConfig,
    ) -> Result<IfRef, Error> {
        self.add_path_if_vertex(branch, PathKind::Then, id, config)
    }

    pub fn add_if_vertex_to_else(
        &mut self,
        branch: IfRef,
        id: u32,
        config: IfConfig,
    ) -> Result<IfRef, Error> {
        self.add_path_if_vertex(branch, PathKind::Else, id, config)
    }

    fn add_path_if_vertex(
        &mut self,
        branch: IfRef,
        path: PathKind,
        id: u32,
        config: IfConfig,
    ) -> Result<IfRef, Error> {
        if self.ifs[branch.0].path(path).vertices.contains_key(&id) {
            return Err(Error::DuplicatePathVertex(path, id));
        }
        let unit = self.ifs[branch.0].unit;
        let nested = self.build_if_vertex(unit, id, config)?;
        self.ifs[branch.0].paths[path.idx()]
            .vertices
            .insert(id, NodeRef::If(nested));
        Ok(nested)
    }

    pub fn connect_inside_then_path(
        &mut self,
        branch: IfRef,
        sub_node: u32,
        obs_node: u32,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        self.connect_inside_path(branch, PathKind::Then, sub_node, obs_node, obs_id, val_id)
    }

    pub fn connect_inside_else_path(
        &mut self,
        branch: IfRef,
        sub_node: u32,
        obs_node: u32,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        self.connect_inside_path(branch, PathKind::Else, sub_node, obs_node, obs_id, val_id)
    }

    /// Bind an observer of one path vertex onto another vertex of the same
    /// path. Both endpoints must live inside that path.
    fn connect_inside_path(
        &mut self,
        branch: IfRef,
        path: PathKind,
        sub_node: u32,
        obs_node: u32,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        let sub = self.path_node(branch, path, sub_node)?;
        let obs = self.path_node(branch, path, obs_node)?;
        let observer = self
            .node_observer(obs, obs_id)
            .ok_or(Error::UnknownObserver(obs_id))?;
        self.node_subject_mut(sub).register_observer(observer, val_id);
        Ok(())
    }

    pub fn connect_to_then_dependency(
        &mut self,
        branch: IfRef,
        obs_node: u32,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        self.connect_to_path_dependency(branch, PathKind::Then, obs_node, obs_id, val_id)
    }

    pub fn connect_to_else_dependency(
        &mut self,
        branch: IfRef,
        obs_node: u32,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        self.connect_to_path_dependency(branch, PathKind::Else, obs_node, obs_id, val_id)
    }

    /// Feed an if-vertex inbound dependency to a vertex placed inside a
    /// path: the path subject re-notifies `val_id` whenever the arm is
    /// activated.
    fn connect_to_path_dependency(
        &mut self,
        branch: IfRef,
        path: PathKind,
        obs_node: u32,
        obs_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        let in_edges = self.ifs[branch.0].in_edges();
        if val_id as usize >= in_edges {
            return Err(Error::InvalidEdge(val_id, in_edges));
        }
        let node = self.path_node(branch, path, obs_node)?;
        let observer = self
            .node_observer(node, obs_id)
            .ok_or(Error::UnknownObserver(obs_id))?;
        self.ifs[branch.0].paths[path.idx()]
            .subject
            .register_observer(observer, val_id);
        self.ifs[branch.0].node_sets[path.idx()].insert(val_id);
        Ok(())
    }

    pub fn register_then_out_dependency(
        &mut self,
        branch: IfRef,
        sub_node: u32,
        in_edge_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        self.register_path_out_dependency(branch, PathKind::Then, sub_node, in_edge_id, val_id)
    }

    pub fn register_else_out_dependency(
        &mut self,
        branch: IfRef,
        sub_node: u32,
        in_edge_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        self.register_path_out_dependency(branch, PathKind::Else, sub_node, in_edge_id, val_id)
    }

    /// Declare that path vertex `sub_node` writes the final value of
    /// outbound slot `in_edge_id`. Creates a join event for the path's
    /// AND-list and a write-back observer on the sub-vertex's output
    /// `val_id`.
    fn register_path_out_dependency(
        &mut self,
        branch: IfRef,
        path: PathKind,
        sub_node: u32,
        in_edge_id: u32,
        val_id: u32,
    ) -> Result<(), Error> {
        let in_edges = self.ifs[branch.0].in_edges();
        if in_edge_id as usize >= in_edges {
            return Err(Error::InvalidEdge(in_edge_id, in_edges));
        }
        let node = self.path_node(branch, path, sub_node)?;

        let name = format!(
            "{}_outEdgeEv{}",
            self.ifs[branch.0].name(),
            self.ifs[branch.0].join_event_count
        );
        let ev = self.kernel.add_event(&name);
        self.ifs[branch.0].join_event_count += 1;
        self.kernel
            .and_list_push(self.ifs[branch.0].join_lists[path.idx()], ev);

        let observer = self.add_observer(ObserverRecord {
            event: ev,
            dest: DestSlot::Outbound {
                branch,
                index: in_edge_id as usize,
            },
            kind: ObserverKind::Interconnect { changed: false },
        });
        self.ifs[branch.0].end_obs.add(observer);
        self.node_subject_mut(node).register_observer(observer, val_id);
        Ok(())
    }

    pub fn then_path_node(&self, branch: IfRef, id: u32) -> Result<NodeRef, Error> {
        self.path_node(branch, PathKind::Then, id)
    }

    pub fn else_path_node(&self, branch: IfRef, id: u32) -> Result<NodeRef, Error> {
        self.path_node(branch, PathKind::Else, id)
    }

    fn path_node(&self, branch: IfRef, path: PathKind, id: u32) -> Result<NodeRef, Error> {
        self.ifs[branch.0]
            .path(path)
            .vertices
            .get(&id)
            .copied()
            .ok_or(Error::UnknownPathNode(path, id))
    }

    /// One resume step of the condition-check task: on activation, pass
    /// every inbound descriptor through to the outbound vector and notify
    /// the chosen arm's dependencies.
    pub(crate) fn resume_if_dispatch(&mut self, branch: IfRef) -> Wait {
        let begin_list = self.ifs[branch.0].begin_list;
        if !self.ifs[branch.0].dispatch_armed {
            self.ifs[branch.0].dispatch_armed = true;
            return Wait::All(begin_list);
        }

        // Unchanged values pass through by reference; write-back observers
        // overwrite individual outbound slots later.
        let state = &mut self.ifs[branch.0];
        state.outbound = state.inbound.clone();
        let path = if state.condition {
            PathKind::Then
        } else {
            PathKind::Else
        };
        debug!(
            "{}: condition {} takes {} path at {}",
            state.name(),
            state.condition,
            path,
            self.kernel.now()
        );
        let val_ids: Vec<u32> = state.node_sets[path.idx()].iter().copied().collect();
        for val_id in val_ids {
            self.notify_path_observers(branch, path, val_id);
        }

        // With no write-backs registered the join list can never fire;
        // the activation completes here with pure pass-through.
        if self.kernel.and_list_len(self.ifs[branch.0].join_lists[path.idx()]) == 0 {
            self.notify_if_end_observers(branch);
        }
        Wait::All(begin_list)
    }

    /// One resume step of a join task: once every write-back of the arm
    /// has landed, publish all outbound slots to the external successors.
    pub(crate) fn resume_if_join(&mut self, branch: IfRef, path: PathKind) -> Wait {
        let join_list = self.ifs[branch.0].join_lists[path.idx()];
        if !self.ifs[branch.0].join_armed[path.idx()] {
            self.ifs[branch.0].join_armed[path.idx()] = true;
            return Wait::All(join_list);
        }
        self.notify_if_end_observers(branch);
        Wait::All(join_list)
    }

    /// Re-notify one inbound value into an arm of the if.
    fn notify_path_observers(&mut self, branch: IfRef, path: PathKind, val_id: u32) {
        let state = &self.ifs[branch.0];
        let desc = state.inbound[val_id as usize].unwrap_or_else(|| {
            panic!(
                "{}: inbound edge {} notified before data arrived",
                state.path(path).subject.name(),
                val_id
            )
        });
        let name = String::from(state.path(path).subject.name());
        let matching = state.path(path).subject.matching(val_id);
        self.fanout(&name, &matching, desc);
    }

    /// Publish every outbound slot to the if-vertex's external successors.
    pub(crate) fn notify_if_end_observers(&mut self, branch: IfRef) {
        for index in 0..self.ifs[branch.0].outbound.len() {
            let state = &self.ifs[branch.0];
            let desc = state.outbound[index].unwrap_or_else(|| {
                panic!(
                    "{}: outbound slot {} published before data arrived",
                    state.name(),
                    index
                )
            });
            let name = String::from(state.name());
            let matching = state.subject.matching(index as u32);
            self.fanout(&name, &matching, desc);
        }
    }
}
