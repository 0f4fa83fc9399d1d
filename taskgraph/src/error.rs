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

use petgraph::prelude::*;
use std::fmt;

use crate::ifvertex::PathKind;
use crate::vertex::OpKind;
use crate::ValueType;

/// Structural errors, raised while the graph is being elaborated.
///
/// Anything that goes wrong after the kernel has started is a contract
/// violation and panics with the offending subject's name instead.
#[derive(Debug, PartialEq)]
pub enum Error {
    DuplicateVertex(NodeIndex, u32),
    DuplicatePathVertex(PathKind, u32),
    UnknownPathNode(PathKind, u32),
    UnknownObserver(u32),
    UnknownLink(NodeIndex, usize),
    InterconnectMissing(NodeIndex),
    InvalidEdge(u32, usize),
    InvalidValueId(u32),
    TypeMismatch { expected: ValueType, found: ValueType },
    BadArity { kind: OpKind, expected: usize, found: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DuplicateVertex(u, id) => {
                write!(
                    f,
                    "ERROR: vertex {} already exists on unit {}",
                    id,
                    u.index()
                )
            }
            Self::DuplicatePathVertex(path, id) => {
                write!(f, "ERROR: vertex {} already exists in {} path", id, path)
            }
            Self::UnknownPathNode(path, id) => {
                write!(f, "ERROR: no node {} in {} path", id, path)
            }
            Self::UnknownLink(u, l) => {
                write!(f, "ERROR: no out link {} on unit {}", l, u.index())
            }
            Self::InvalidEdge(id, limit) => {
                write!(f, "ERROR: in-edge {} out of range (limit {})", id, limit)
            }
            Self::TypeMismatch { expected, found } => {
                write!(f, "ERROR: value type {} where {} expected", found, expected)
            }
            Self::BadArity {
                kind,
                expected,
                found,
            } => {
                write!(
                    f,
                    "ERROR: {:?} takes {} inputs, {} configured",
                    kind, expected, found
                )
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // needed so `anyhow::Result` in the apps accepts our errors.
        None
    }
}
