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

//! A discrete-event task-graph simulator.
//!
//! Graphs of typed compute vertices execute on processing units that
//! serialize concurrent activations; values flow through a
//! subject/observer layer, branch through hierarchical if-vertices, and
//! cross unit boundaries over a pooled-transaction interconnect. All
//! timing is virtual: a cooperative kernel advances simulated time over a
//! pending-notification queue with zero-delay delta cycles.

mod error;
mod ifvertex;
mod interconnect;
mod kernel;
mod payload;
mod sim;
pub mod specs;
mod subject;
mod unit;
mod vertex;

// Public types
// clustering color for user partitioning of the graph
pub type Color = u32;

pub use crate::error::Error;
pub use crate::ifvertex::{IfConfig, IfVertex, PathKind};
pub use crate::interconnect::{
    DimensionOrderRouting, Interconnect, InterconnectConfig, Link, LinkDirection, LinkManager,
    RoutingPolicy, TransmissionData,
};
pub use crate::kernel::{AndListId, EventId, Kernel, TaskId, Wait};
pub use crate::payload::{
    Command, Payload, PayloadId, PayloadPool, ResponseStatus, RoutingInfo,
};
pub use crate::sim::{ProbeState, Simulation, SourceState};
pub use crate::specs::{
    IfRef, NodeRef, ProbeRef, SimTime, SourceRef, SubjectRef, Value, ValueDesc, ValueSlot,
    ValueType, VertexRef,
};
pub use crate::subject::{
    DestSlot, ObserverId, ObserverManager, ObserverRecord, Subject, UNUSED_SUBJECT,
};
pub use crate::unit::ProcessingUnit;
pub use crate::vertex::{ComputeVertex, OpKind, VertexConfig};
pub use petgraph::graph::{EdgeIndex, NodeIndex};
