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

//! Traffic leaving the bottom row: aggregation, publication and device
//! parameter reads.

use fabric::{
    Instruction, Mesh, MeshConfiguration, Message, NodeId, Operand, OutputMapping, Parameter,
    ResponseStrategy, SimulationCallbacks, TargetSelection,
};

const MAX_STEPS: usize = 1000;

fn follower() -> Instruction {
    Instruction::new(
        0b1111_0000,
        [Operand::input(0), Operand::register(0), Operand::register(0)],
        0,
    )
    .with_output()
}

fn inverter() -> Instruction {
    Instruction::new(
        0b0000_1111,
        [Operand::input(0), Operand::register(0), Operand::register(0)],
        0,
    )
    .with_output()
}

#[test]
fn publishes_changed_outputs() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let mut callbacks = SimulationCallbacks::default();
    let mut mesh = Mesh::new(MeshConfiguration::new(2, 2)).unwrap();
    let node = NodeId::new(1, 0);
    let scope = NodeId::new(2, 0);
    mesh.load(
        node,
        &[follower()],
        0,
        &[vec![OutputMapping::new(scope, 3, false)]],
    )
    .unwrap();

    mesh.inject(node, &Message::signal(node, 0, false, true))
        .unwrap();
    mesh.run_until_idle(MAX_STEPS, &mut callbacks).unwrap();
    mesh.run_cycle(MAX_STEPS, &mut callbacks).unwrap();
    assert_eq!(mesh.publications().len(), 1);
    let publication = &mesh.publications()[0];
    assert_eq!(publication.scope, scope);
    assert!(publication.state[3]);
    assert_eq!(publication.state.count_ones(), 1);
    assert_eq!(mesh.aggregator(0).unwrap().state(), &publication.state[..]);

    // nothing changes, so nothing is sent
    assert_eq!(mesh.settle(4, MAX_STEPS, &mut callbacks).unwrap(), 1);
    assert_eq!(mesh.publications().len(), 1);

    mesh.inject(node, &Message::signal(node, 0, false, false))
        .unwrap();
    mesh.run_until_idle(MAX_STEPS, &mut callbacks).unwrap();
    mesh.run_cycle(MAX_STEPS, &mut callbacks).unwrap();
    assert_eq!(mesh.publications().len(), 2);
    assert!(mesh.publications()[1].state.not_any());
    assert!(mesh.egress().is_empty());
}

#[test]
fn column_selection_follows_the_target() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let mut callbacks = SimulationCallbacks::default();
    let mut mesh = Mesh::new(MeshConfiguration::new(2, 3)).unwrap();
    mesh.load(
        NodeId::new(0, 0),
        &[inverter()],
        0,
        &[vec![OutputMapping::new(NodeId::new(2, 2), 5, false)]],
    )
    .unwrap();
    mesh.run_cycle(MAX_STEPS, &mut callbacks).unwrap();

    assert!(mesh.aggregator(0).unwrap().state().not_any());
    assert!(mesh.aggregator(2).unwrap().state()[5]);
    assert_eq!(mesh.publications().len(), 1);
    assert_eq!(mesh.publications()[0].scope, NodeId::new(2, 2));
}

#[test]
fn random_selection_is_reproducible() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let run = || {
        let mut config = MeshConfiguration::new(1, 4);
        config.egress.selection = TargetSelection::Random { seed: 11 };
        let mut mesh = Mesh::new(config).unwrap();
        for column in 0..4 {
            let mapping = OutputMapping::new(NodeId::new(1, column), column, false);
            mesh.load(NodeId::new(0, column), &[inverter()], 0, &[vec![mapping]])
                .unwrap();
        }
        mesh.run_cycle(MAX_STEPS, &mut SimulationCallbacks::default())
            .unwrap();
        mesh
    };
    let first = run();
    let second = run();
    // every word is either folded into its own aggregator or passed through
    assert_eq!(first.publications().len() + first.egress().len(), 4);
    assert_eq!(first.publications(), second.publications());
    assert_eq!(first.egress(), second.egress());
    assert_eq!(first.dropped(), 0);
}

#[test]
fn control_reads_answer_to_the_egress_row() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let mut callbacks = SimulationCallbacks::default();
    let mut mesh = Mesh::new(MeshConfiguration::new(2, 2)).unwrap();
    let node = NodeId::new(0, 1);
    mesh.inject(
        NodeId::new(0, 0),
        &Message::control(node, Parameter::Rows, 0),
    )
    .unwrap();
    mesh.inject(
        NodeId::new(0, 0),
        &Message::control(node, Parameter::NodeRegisters, 0),
    )
    .unwrap();
    mesh.run_until_idle(MAX_STEPS, &mut callbacks).unwrap();

    let responses = mesh
        .egress()
        .iter()
        .map(|word| mesh.layout().decode_message(word).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(
        responses,
        vec![
            Message::control(NodeId::new(2, 1), Parameter::Rows, 2),
            Message::control(NodeId::new(2, 1), Parameter::NodeRegisters, 16),
        ]
    );
    assert!(mesh.publications().is_empty());
}

struct Fixed;

impl ResponseStrategy for Fixed {
    fn respond(&self, address: u64) -> u64 {
        if address == Parameter::Identity.code() {
            0x5a5a
        } else {
            0
        }
    }
}

#[test]
fn custom_responder_answers_reads() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let mut callbacks = SimulationCallbacks::default();
    let mut mesh = Mesh::new(MeshConfiguration::new(1, 1))
        .unwrap()
        .with_responder(Box::new(Fixed));
    let node = NodeId::new(0, 0);
    mesh.inject(node, &Message::control(node, Parameter::Identity, 0))
        .unwrap();
    mesh.inject(node, &Message::control(node, Parameter::Version, 0))
        .unwrap();
    mesh.run_until_idle(MAX_STEPS, &mut callbacks).unwrap();

    let values = mesh
        .egress()
        .iter()
        .map(|word| mesh.layout().decode_message(word).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(
        values,
        vec![
            Message::control(NodeId::new(1, 0), Parameter::Identity, 0x5a5a),
            Message::control(NodeId::new(1, 0), Parameter::Version, 0),
        ]
    );
}

#[test]
fn writable_parameters_report_their_value() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let mut callbacks = SimulationCallbacks::default();
    let mut mesh = Mesh::new(MeshConfiguration::new(1, 1)).unwrap();
    let node = NodeId::new(0, 0);
    mesh.inject(node, &Message::control(node, Parameter::LoopbackMask, 0b11))
        .unwrap();
    mesh.inject(node, &Message::read(node, Parameter::LoopbackMask))
        .unwrap();
    mesh.inject(node, &Message::read(node, Parameter::InstructionCount))
        .unwrap();
    mesh.run_until_idle(MAX_STEPS, &mut callbacks).unwrap();

    let values = mesh
        .egress()
        .iter()
        .map(|word| mesh.layout().decode_message(word).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(
        values,
        vec![
            Message::control(NodeId::new(1, 0), Parameter::LoopbackMask, 0b11),
            Message::control(NodeId::new(1, 0), Parameter::InstructionCount, 0),
        ]
    );
    assert_eq!(mesh.node(node).unwrap().state().loopback(), 0b11);
}
