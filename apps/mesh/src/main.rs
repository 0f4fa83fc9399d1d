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

//! A small two-unit mesh: an adder feeds an if-vertex whose chosen arm
//! rewrites one value, and the joined result crosses an interconnect link
//! to the second unit.

use anyhow::Result;
use env_logger::Target;
use structopt::StructOpt;

use taskgraph::{
    IfConfig, InterconnectConfig, LinkDirection, NodeRef, OpKind, SimTime, Simulation, SubjectRef,
    TransmissionData, Value, ValueType, VertexConfig,
};

#[derive(StructOpt)]
#[structopt(name = "mesh", about = "A two-unit task-graph mesh demo")]
struct Arguments {
    /// take the else path instead of the then path
    #[structopt(short, long)]
    else_path: bool,
    /// adder latency in nanoseconds
    #[structopt(short, long, default_value = "5")]
    latency: u64,
    #[structopt(short, long, default_value = "7")]
    a: u32,
    #[structopt(short, long, default_value = "11")]
    b: u32,
}

fn main() -> Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("taskgraph"), log::LevelFilter::Debug)
        .target(Target::Stderr)
        .try_init();

    let mut sim = Simulation::new();
    let alpha = sim.add_unit("alpha", 0);
    let beta = sim.add_unit("beta", 1);
    sim.add_link(alpha, beta, 0);
    sim.enable_interconnect(
        alpha,
        InterconnectConfig {
            request_delay: SimTime::from_ns(2),
            response_delay: SimTime::from_ns(2),
            routing_latency: SimTime::from_ns(1),
        },
        1,
        &[(LinkDirection::Right, 0)],
    );
    sim.enable_interconnect(beta, InterconnectConfig::default(), 0, &[]);

    let a = sim.add_source("a", Value::U32(args.a), SimTime::ZERO);
    let b = sim.add_source("b", Value::U32(args.b), SimTime::ZERO);
    let cond = sim.add_source("cond", Value::Bool(!args.else_path), SimTime::ZERO);

    let sum = sim.add_vertex(
        alpha,
        1,
        VertexConfig::new("sum", OpKind::Add).latency(SimTime::from_ns(args.latency)),
    )?;
    sim.connect(SubjectRef::Source(a), NodeRef::Vertex(sum), 0, 0)?;
    sim.connect(SubjectRef::Source(b), NodeRef::Vertex(sum), 1, 0)?;

    // edge 0 carries `a`, edge 1 the adder result; the chosen arm rewrites
    // edge 0 and edge 1 passes through
    let branch = sim.add_if_vertex(alpha, 2, IfConfig::new("gate", 2, SubjectRef::Source(cond)))?;
    sim.connect(SubjectRef::Source(a), NodeRef::If(branch), 0, 0)?;
    sim.connect(SubjectRef::Vertex(sum), NodeRef::If(branch), 1, 0)?;

    sim.add_vertex_to_then(
        branch,
        10,
        VertexConfig::new("dec", OpKind::PostDec)
            .types(&[ValueType::U32], ValueType::U32)
            .latency(SimTime::from_ns(2)),
    )?;
    sim.connect_to_then_dependency(branch, 10, 0, 0)?;
    sim.register_then_out_dependency(branch, 10, 0, 0)?;

    sim.add_vertex_to_else(
        branch,
        20,
        VertexConfig::new("inc", OpKind::PostInc)
            .types(&[ValueType::U32], ValueType::U32)
            .latency(SimTime::from_ns(3)),
    )?;
    sim.connect_to_else_dependency(branch, 20, 0, 0)?;
    sim.register_else_out_dependency(branch, 20, 0, 0)?;

    // ship the joined edge-0 value over to beta
    sim.add_transmit(
        SubjectRef::If(branch),
        0,
        alpha,
        TransmissionData {
            out_link: 0,
            dx: 1,
            dy: 0,
            dest_value_id: 0,
        },
    )?;
    let remote = sim.add_probe(
        "beta_val0",
        SubjectRef::Interconnect(beta),
        0,
        ValueType::U32,
    )?;
    let local = sim.add_probe("gate_val1", SubjectRef::If(branch), 1, ValueType::U32)?;

    let end = sim.run(None);
    log::info!("simulation finished at {}", end);

    for (at, value) in sim.probe(local).samples() {
        println!("gate edge 1 -> {} at {}", value, at);
    }
    for (at, value) in sim.probe(remote).samples() {
        println!("beta value 0 -> {} at {}", value, at);
    }
    Ok(())
}
