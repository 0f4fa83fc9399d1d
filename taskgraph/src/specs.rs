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

//! Shared vocabulary: simulated time, typed values, and the handles that
//! address graph storage.

use std::fmt;
use std::ops::{Add, AddAssign};

use petgraph::graph::NodeIndex;

/// A point in (or span of) simulated time, in nanoseconds.
///
/// The same type serves for instants and durations; the kernel only ever
/// adds durations to instants and compares instants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(pub u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_ns(ns: u64) -> Self {
        SimTime(ns)
    }

    pub fn ns(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for SimTime {
    type Output = SimTime;
    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0 + rhs.0)
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ns", self.0)
    }
}

/// The scalar types a value channel can carry.
///
/// Source and destination of a connection must agree on the type; this is
/// checked at elaboration time where both ends are statically known and
/// asserted at notification time otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
}

impl ValueType {
    pub fn size_bytes(&self) -> usize {
        match self {
            ValueType::Bool | ValueType::U8 => 1,
            ValueType::U16 => 2,
            ValueType::U32 | ValueType::I32 => 4,
            ValueType::U64 | ValueType::I64 => 8,
        }
    }

    /// The zero value of this type, used to initialize input slots.
    pub fn default_value(&self) -> Value {
        Value::from_wide(*self, 0)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::U8 => "u8",
            ValueType::U16 => "u16",
            ValueType::U32 => "u32",
            ValueType::U64 => "u64",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
        };
        name.fmt(f)
    }
}

/// One typed scalar travelling between vertices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::U8(_) => ValueType::U8,
            Value::U16(_) => ValueType::U16,
            Value::U32(_) => ValueType::U32,
            Value::U64(_) => ValueType::U64,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
        }
    }

    /// Widen to a common intermediate so operations behave like the
    /// usual integer promotions; the result is truncated back through
    /// [`Value::from_wide`].
    pub fn as_wide(&self) -> i128 {
        match self {
            Value::Bool(b) => *b as i128,
            Value::U8(v) => *v as i128,
            Value::U16(v) => *v as i128,
            Value::U32(v) => *v as i128,
            Value::U64(v) => *v as i128,
            Value::I32(v) => *v as i128,
            Value::I64(v) => *v as i128,
        }
    }

    /// Truncating cast of a wide intermediate into `ty`.
    pub fn from_wide(ty: ValueType, wide: i128) -> Value {
        match ty {
            ValueType::Bool => Value::Bool(wide != 0),
            ValueType::U8 => Value::U8(wide as u8),
            ValueType::U16 => Value::U16(wide as u16),
            ValueType::U32 => Value::U32(wide as u32),
            ValueType::U64 => Value::U64(wide as u64),
            ValueType::I32 => Value::I32(wide as i32),
            ValueType::I64 => Value::I64(wide as i64),
        }
    }

    pub fn truthy(&self) -> bool {
        self.as_wide() != 0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => b.fmt(f),
            Value::U8(v) => v.fmt(f),
            Value::U16(v) => v.fmt(f),
            Value::U32(v) => v.fmt(f),
            Value::U64(v) => v.fmt(f),
            Value::I32(v) => v.fmt(f),
            Value::I64(v) => v.fmt(f),
        }
    }
}

/// Handle of a compute vertex in the simulation arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexRef(pub(crate) usize);

impl VertexRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handle of an if-vertex in the simulation arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IfRef(pub(crate) usize);

impl IfRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handle of a stimulus source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceRef(pub(crate) usize);

/// Handle of a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeRef(pub(crate) usize);

/// A node that owns an observer manager and can be the destination of a
/// `connect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRef {
    Vertex(VertexRef),
    If(IfRef),
}

/// Anything that publishes values, addressable as the source of a
/// `connect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubjectRef {
    Vertex(VertexRef),
    If(IfRef),
    ThenPath(IfRef),
    ElsePath(IfRef),
    Source(SourceRef),
    Interconnect(NodeIndex),
}

/// Where a concrete value lives. Observers and payloads address storage
/// through these handles instead of raw pointers, so a descriptor stays
/// valid for the life of the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueSlot {
    VertexOut { vertex: VertexRef },
    Source { source: SourceRef },
}

/// Descriptor of a value: the slot holding it plus its size in bytes.
/// This is what crosses the if-vertex and the interconnect instead of an
/// eager copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueDesc {
    pub slot: ValueSlot,
    pub bytes: usize,
}
