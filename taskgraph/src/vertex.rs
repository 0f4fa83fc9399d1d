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

//! Compute vertices: one task-graph node, one operation per activation.

use log::debug;
use petgraph::graph::NodeIndex;

use crate::error::Error;
use crate::kernel::{AndListId, EventId, Wait};
use crate::sim::Simulation;
use crate::specs::{NodeRef, SimTime, Value, ValueDesc, ValueSlot, ValueType, VertexRef};
use crate::subject::{DestSlot, ObserverKind, ObserverManager, ObserverRecord, Subject};
use crate::Color;

/// Every operation a vertex can perform.
///
/// One generic vertex with a pluggable operation replaces a class per
/// operation; the inputs a kind consumes are positional, with `Ternary`
/// taking its condition third and `Select` taking its selector first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    BitAnd,
    BitOr,
    BitXor,
    LogicAnd,
    LogicOr,
    LogicNot,
    GEqual,
    LEqual,
    Equal,
    NotEqual,
    Greater,
    Less,
    PostInc,
    PostDec,
    Ternary,
    Cast,
    Select,
    Assign,
}

impl OpKind {
    pub fn arity(&self) -> usize {
        match self {
            OpKind::LogicNot
            | OpKind::PostInc
            | OpKind::PostDec
            | OpKind::Cast
            | OpKind::Assign => 1,
            OpKind::Ternary | OpKind::Select => 3,
            _ => 2,
        }
    }

    /// Apply the operation over the stored inputs, producing a value of
    /// the vertex's output type. Post-increment/decrement update the
    /// stored input and return the prior value.
    pub(crate) fn apply(&self, name: &str, inputs: &mut [Value], out: ValueType) -> Value {
        debug_assert_eq!(inputs.len(), self.arity());
        let wide = |i: usize| inputs[i].as_wide();
        let result: i128 = match self {
            OpKind::Add => wide(0) + wide(1),
            OpKind::Sub => wide(0) - wide(1),
            OpKind::Mul => wide(0) * wide(1),
            OpKind::Div => {
                assert!(wide(1) != 0, "{}: division by zero", name);
                wide(0) / wide(1)
            }
            OpKind::BitAnd => wide(0) & wide(1),
            OpKind::BitOr => wide(0) | wide(1),
            OpKind::BitXor => wide(0) ^ wide(1),
            OpKind::LogicAnd => (inputs[0].truthy() && inputs[1].truthy()) as i128,
            OpKind::LogicOr => (inputs[0].truthy() || inputs[1].truthy()) as i128,
            OpKind::LogicNot => (!inputs[0].truthy()) as i128,
            OpKind::GEqual => (wide(0) >= wide(1)) as i128,
            OpKind::LEqual => (wide(0) <= wide(1)) as i128,
            OpKind::Equal => (wide(0) == wide(1)) as i128,
            OpKind::NotEqual => (wide(0) != wide(1)) as i128,
            OpKind::Greater => (wide(0) > wide(1)) as i128,
            OpKind::Less => (wide(0) < wide(1)) as i128,
            OpKind::PostInc => {
                let prior = inputs[0].as_wide();
                inputs[0] = Value::from_wide(inputs[0].ty(), prior + 1);
                prior
            }
            OpKind::PostDec => {
                let prior = inputs[0].as_wide();
                inputs[0] = Value::from_wide(inputs[0].ty(), prior - 1);
                prior
            }
            OpKind::Ternary => {
                if inputs[2].truthy() {
                    wide(0)
                } else {
                    wide(1)
                }
            }
            OpKind::Select => {
                if inputs[0].truthy() {
                    wide(1)
                } else {
                    wide(2)
                }
            }
            OpKind::Cast | OpKind::Assign => wide(0),
        };
        Value::from_wide(out, result)
    }
}

/// Parameters of a compute vertex.
///
/// Input and output types are fixed here; `new` defaults every data input
/// to u32 and condition/selector inputs to bool, which covers the common
/// case and can be overridden field by field.
#[derive(Clone, Debug)]
pub struct VertexConfig {
    pub name: String,
    pub kind: OpKind,
    pub color: Color,
    pub latency: SimTime,
    pub input_types: Vec<ValueType>,
    pub output_type: ValueType,
}

impl VertexConfig {
    pub fn new(name: &str, kind: OpKind) -> Self {
        let mut input_types = vec![ValueType::U32; kind.arity()];
        match kind {
            OpKind::Ternary => input_types[2] = ValueType::Bool,
            OpKind::Select => input_types[0] = ValueType::Bool,
            _ => {}
        }
        Self {
            name: String::from(name),
            kind,
            color: 0,
            latency: SimTime::ZERO,
            input_types,
            output_type: ValueType::U32,
        }
    }

    pub fn latency(mut self, latency: SimTime) -> Self {
        self.latency = latency;
        self
    }

    pub fn color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn types(mut self, inputs: &[ValueType], output: ValueType) -> Self {
        self.input_types = inputs.to_vec();
        self.output_type = output;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VertexPhase {
    Init,
    AwaitInputs,
    AwaitCore,
    Latency,
}

/// A task-graph node owned by a processing unit.
///
/// Carries its own input/output storage; observers installed at
/// construction write arriving values into the input slots and fire the
/// per-input events the inbound AND-list is built from.
#[derive(Debug)]
pub struct ComputeVertex {
    pub(crate) subject: Subject,
    pub(crate) number: u32,
    pub(crate) color: Color,
    pub(crate) latency: SimTime,
    pub(crate) unit: NodeIndex,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<Value>,
    pub(crate) input_types: Vec<ValueType>,
    /// Out-value id and last computed result; the generic vertex has a
    /// single output, id 0.
    pub(crate) output: (u32, Value),
    pub(crate) output_type: ValueType,
    pub(crate) core_free: EventId,
    pub(crate) inbound: AndListId,
    pub(crate) input_obs: ObserverManager,
    pub(crate) phase: VertexPhase,
}

pub(crate) const VERTEX_OUTPUTS: u32 = 1;

impl ComputeVertex {
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

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// The last computed result.
    pub fn result(&self) -> Value {
        self.output.1
    }
}

impl Simulation {
    /// Add a compute vertex to a processing unit. The vertex number keys
    /// the unit's vertex map and must be unique on the unit.
    pub fn add_vertex(
        &mut self,
        unit: NodeIndex,
        id: u32,
        config: VertexConfig,
    ) -> Result<VertexRef, Error> {
        if self.topo[unit].vertex(id).is_some() {
            return Err(Error::DuplicateVertex(unit, id));
        }
        let vertex = self.build_vertex(unit, id, config)?;
        assert!(self.topo[unit].insert_vertex(id, NodeRef::Vertex(vertex)));
        Ok(vertex)
    }

    /// Construct the vertex without registering it anywhere; shared
    /// between unit-level and if-path placement.
    pub(crate) fn build_vertex(
        &mut self,
        unit: NodeIndex,
        id: u32,
        config: VertexConfig,
    ) -> Result<VertexRef, Error> {
        if config.input_types.len() != config.kind.arity() {
            return Err(Error::BadArity {
                kind: config.kind,
                expected: config.kind.arity(),
                found: config.input_types.len(),
            });
        }
        let vertex = VertexRef(self.vertices.len());
        let subject = Subject::new(self.alloc_subject_id(), &config.name);

        let inbound = self.kernel.add_and_list();
        let mut input_obs = ObserverManager::new();
        for index in 0..config.input_types.len() {
            let ev = self
                .kernel
                .add_event(&format!("{}_input{}Ev", config.name, index));
            self.kernel.and_list_push(inbound, ev);
            let obs = self.add_observer(ObserverRecord {
                event: ev,
                dest: DestSlot::Input { vertex, index },
                kind: ObserverKind::Plain,
            });
            input_obs.add(obs);
        }
        let core_free = self
            .kernel
            .add_event(&format!("{}_coreFreeEv", config.name));
        self.spawn_task(
            &format!("{}_process", config.name),
            crate::sim::TaskOwner::Vertex(vertex),
        );

        self.vertices.push(ComputeVertex {
            subject,
            number: id,
            color: config.color,
            latency: config.latency,
            unit,
            kind: config.kind,
            inputs: config
                .input_types
                .iter()
                .map(|ty| ty.default_value())
                .collect(),
            input_types: config.input_types,
            output: (0, config.output_type.default_value()),
            output_type: config.output_type,
            core_free,
            inbound,
            input_obs,
            phase: VertexPhase::Init,
        });
        Ok(vertex)
    }

    pub fn vertex(&self, vertex: VertexRef) -> &ComputeVertex {
        &self.vertices[vertex.0]
    }

    /// One resume step of the vertex's execute loop:
    /// wait for all inputs, arbitrate for the core, compute, release, and
    /// publish after the declared latency.
    pub(crate) fn resume_vertex(&mut self, vertex: VertexRef) -> Wait {
        match self.vertices[vertex.0].phase {
            VertexPhase::Init => {
                self.vertices[vertex.0].phase = VertexPhase::AwaitInputs;
                Wait::All(self.vertices[vertex.0].inbound)
            }
            VertexPhase::AwaitInputs => {
                let unit = self.vertices[vertex.0].unit;
                let core_free = self.vertices[vertex.0].core_free;
                debug!(
                    "{}: inputs ready at {}",
                    self.vertices[vertex.0].name(),
                    self.kernel.now()
                );
                self.topo[unit].request_core(&mut self.kernel, core_free);
                self.vertices[vertex.0].phase = VertexPhase::AwaitCore;
                Wait::Event(core_free)
            }
            VertexPhase::AwaitCore => {
                let state = &mut self.vertices[vertex.0];
                let result = state
                    .kind
                    .apply(state.subject.name(), &mut state.inputs, state.output_type);
                state.output.1 = result;
                let (unit, latency) = (state.unit, state.latency);
                debug!(
                    "{}: computed {} at {}",
                    self.vertices[vertex.0].name(),
                    result,
                    self.kernel.now()
                );
                self.topo[unit].release_core(&mut self.kernel, latency);
                self.vertices[vertex.0].phase = VertexPhase::Latency;
                Wait::Delay(latency)
            }
            VertexPhase::Latency => {
                let out_id = self.vertices[vertex.0].output.0;
                self.notify_vertex_observers(vertex, out_id);
                self.vertices[vertex.0].phase = VertexPhase::AwaitInputs;
                Wait::All(self.vertices[vertex.0].inbound)
            }
        }
    }

    /// Publish the vertex's output to every observer registered for
    /// `out_id`. An out-of-range id is a contract violation.
    pub fn notify_vertex_observers(&mut self, vertex: VertexRef, out_id: u32) {
        let state = &self.vertices[vertex.0];
        assert!(
            out_id < VERTEX_OUTPUTS,
            "{}: output id {} out of range",
            state.subject.name(),
            out_id
        );
        let desc = ValueDesc {
            slot: ValueSlot::VertexOut { vertex },
            bytes: state.output_type.size_bytes(),
        };
        let name = String::from(state.subject.name());
        let matching = state.subject.matching(out_id);
        self.fanout(&name, &matching, desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: u64) -> Value {
        Value::U32(x as u32)
    }

    #[test]
    fn test_arithmetic_kinds() {
        let out = ValueType::U32;
        let apply = |kind: OpKind, mut ins: Vec<Value>| kind.apply("t", &mut ins, out);
        assert_eq!(apply(OpKind::Add, vec![v(3), v(4)]), v(7));
        assert_eq!(apply(OpKind::Sub, vec![v(9), v(4)]), v(5));
        assert_eq!(apply(OpKind::Mul, vec![v(6), v(7)]), v(42));
        assert_eq!(apply(OpKind::Div, vec![v(42), v(5)]), v(8));
        assert_eq!(apply(OpKind::BitAnd, vec![v(0xF0), v(0x0F)]), v(0));
        assert_eq!(apply(OpKind::BitOr, vec![v(0xF0), v(0x0F)]), v(0xFF));
        assert_eq!(apply(OpKind::BitXor, vec![v(0xFF), v(0x0F)]), v(0xF0));
    }

    #[test]
    fn test_comparison_kinds_yield_bool() {
        let apply =
            |kind: OpKind, mut ins: Vec<Value>| kind.apply("t", &mut ins, ValueType::Bool);
        assert_eq!(apply(OpKind::GEqual, vec![v(4), v(4)]), Value::Bool(true));
        assert_eq!(apply(OpKind::LEqual, vec![v(5), v(4)]), Value::Bool(false));
        assert_eq!(apply(OpKind::Equal, vec![v(4), v(4)]), Value::Bool(true));
        assert_eq!(apply(OpKind::NotEqual, vec![v(4), v(4)]), Value::Bool(false));
        assert_eq!(apply(OpKind::Greater, vec![v(5), v(4)]), Value::Bool(true));
        assert_eq!(apply(OpKind::Less, vec![v(5), v(4)]), Value::Bool(false));
    }

    #[test]
    fn test_logic_kinds() {
        let apply =
            |kind: OpKind, mut ins: Vec<Value>| kind.apply("t", &mut ins, ValueType::Bool);
        assert_eq!(
            apply(OpKind::LogicAnd, vec![v(2), v(0)]),
            Value::Bool(false)
        );
        assert_eq!(apply(OpKind::LogicOr, vec![v(2), v(0)]), Value::Bool(true));
        assert_eq!(apply(OpKind::LogicNot, vec![v(0)]), Value::Bool(true));
    }

    #[test]
    fn test_post_ops_return_prior_value() {
        let mut ins = vec![v(7)];
        let result = OpKind::PostDec.apply("t", &mut ins, ValueType::U32);
        assert_eq!(result, v(7));
        assert_eq!(ins[0], v(6));

        let mut ins = vec![v(7)];
        let result = OpKind::PostInc.apply("t", &mut ins, ValueType::U32);
        assert_eq!(result, v(7));
        assert_eq!(ins[0], v(8));
    }

    #[test]
    fn test_ternary_condition_is_third_input() {
        let mut ins = vec![v(10), v(20), Value::Bool(true)];
        assert_eq!(OpKind::Ternary.apply("t", &mut ins, ValueType::U32), v(10));
        ins[2] = Value::Bool(false);
        assert_eq!(OpKind::Ternary.apply("t", &mut ins, ValueType::U32), v(20));
    }

    #[test]
    fn test_select_condition_is_first_input() {
        let mut ins = vec![Value::Bool(false), v(10), v(20)];
        assert_eq!(OpKind::Select.apply("t", &mut ins, ValueType::U32), v(20));
    }

    #[test]
    fn test_cast_truncates_to_output_type() {
        let mut ins = vec![Value::U32(0x1234_5678)];
        assert_eq!(
            OpKind::Cast.apply("t", &mut ins, ValueType::U8),
            Value::U8(0x78)
        );
        let mut ins = vec![Value::U8(200)];
        assert_eq!(
            OpKind::Assign.apply("t", &mut ins, ValueType::U64),
            Value::U64(200)
        );
    }

    #[test]
    #[should_panic(expected = "division by zero")]
    fn test_division_by_zero_is_fatal() {
        let mut ins = vec![v(1), v(0)];
        OpKind::Div.apply("t", &mut ins, ValueType::U32);
    }

    #[test]
    fn test_config_defaults_follow_arity() {
        let config = VertexConfig::new("and0", OpKind::BitAnd);
        assert_eq!(config.input_types.len(), 2);
        let config = VertexConfig::new("mux", OpKind::Ternary);
        assert_eq!(config.input_types[2], ValueType::Bool);
        let config = VertexConfig::new("sel", OpKind::Select);
        assert_eq!(config.input_types[0], ValueType::Bool);
    }
}
