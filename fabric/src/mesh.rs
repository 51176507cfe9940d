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

use crate::aggregator::{Aggregated, Aggregator, Publication};
use crate::arbiter::{Arbiter, Combiner};
use crate::channel::Channel;
use crate::codec::{Command, Message, WireLayout};
use crate::config::{MeshConfiguration, TargetSelection, COMBINER_SOURCES, INBOUND_SOURCES};
use crate::diagnostics::{DiagnosticSink, DropReport};
use crate::engine::{Engine, Phase};
use crate::error::{AddressError, Error, ProtocolError};
use crate::isa::Instruction;
use crate::response::{DeviceParameters, ResponseStrategy};
use crate::router::{dispatch, route, Decision, Decoder, DispatchContext, Route};
use crate::sim::SimulationCallbacks;
use crate::state::{NodeState, OutputMapping};
use crate::topology::Topology;
use crate::vcd::{VcdComponent, VcdWriter};
use crate::{bit_size, Direction, NodeId, Tick, Word};
use bitvec::prelude::*;
use log::{debug, trace, warn};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Combiner source of words passing through a node.
const BYPASS: usize = 0;
/// Combiner source of words a node originates.
const LOCAL: usize = 1;
/// Inbound arbiter source fed by the host; 0..4 are the compass sides.
const INGRESS: usize = 4;

/// Egress selection seed when none is configured.
const DEFAULT_SEED: u64 = 0x87654321FEDCBA09u64;

/// A routing decision taken by a node, recorded when route tracing is on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteEvent {
    Forwarded {
        step: Tick,
        at: NodeId,
        direction: Direction,
    },
    Consumed {
        step: Tick,
        at: NodeId,
        command: Command,
    },
}

/// Where a node's receive loop is suspended.
#[derive(Clone, Debug)]
enum Process {
    /// Waiting for an inbound word.
    Receive,
    /// Holding a forwarded word for the processing delay.
    Delay {
        until: Tick,
        direction: Direction,
        word: Word,
    },
    /// Waiting for the output port to take the forwarded word.
    Blocked(Direction),
    /// Waiting for room behind a CONTROL response.
    Responding(Direction),
}

/// Drop accounting and route tracing shared by all nodes.
struct Observers {
    diagnostics: Option<Box<dyn DiagnosticSink>>,
    routes: Option<Vec<RouteEvent>>,
    dropped: usize,
    emissions: usize,
}

impl Observers {
    fn drop_word(&mut self, step: Tick, at: Option<NodeId>, error: Error, word: Word) {
        match at {
            Some(id) => warn!("node {}: dropped word at step {}: {}", id, step, error),
            None => warn!("egress: dropped word at step {}: {}", step, error),
        }
        self.dropped += 1;
        if let Some(sink) = self.diagnostics.as_mut() {
            sink.report(DropReport {
                step,
                at,
                error,
                word,
            });
        }
    }

    fn route(&mut self, event: RouteEvent) {
        if let Some(routes) = self.routes.as_mut() {
            routes.push(event);
        }
    }
}

/// Per-step facts every node reads.
struct StepShared<'a> {
    layout: &'a WireLayout,
    context: DispatchContext<'a>,
    processing_delay: Tick,
}

/// A node and its channel endpoints.
struct MeshNode {
    id: NodeId,
    engine: Engine,
    decoder: Decoder,
    process: Process,
    inbound_arbiter: Arbiter,
    /// Channel index arriving on each side.
    inbound: [Option<usize>; 4],
    /// Channel index leaving through each port.
    outbound: [Option<usize>; 4],
    /// Per output port, forwarded traffic against local traffic.
    outputs: Vec<Combiner<Word>>,
    /// Host words not yet admitted to the ingress channel.
    host: VecDeque<Word>,
    ingress: Channel<Word>,
    /// Locally originated words a port may hold, as deep as a channel.
    local_limit: usize,
    active: usize,
    idle: usize,
}

impl MeshNode {
    fn new(id: NodeId, config: &MeshConfiguration) -> Self {
        let arbitration = &config.node.arbitration;
        Self {
            id,
            engine: Engine::new(NodeState::new(id, &config.node)),
            decoder: Decoder::new(id, config),
            process: Process::Receive,
            inbound_arbiter: Arbiter::new(INBOUND_SOURCES, arbitration.inbound),
            inbound: [None; 4],
            outbound: [None; 4],
            outputs: (0..4)
                .map(|_| Combiner::new(COMBINER_SOURCES, arbitration.combine))
                .collect(),
            host: VecDeque::new(),
            ingress: Channel::from_config(&config.channel),
            local_limit: config.channel.capacity,
            active: 0,
            idle: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.engine.phase() == Phase::Capture
            && matches!(self.process, Process::Receive)
            && self.outputs.iter().all(|c| c.is_empty())
            && self.host.is_empty()
            && self.ingress.is_empty()
    }

    fn utilization(&self) -> f64 {
        let total = self.active + self.idle;
        if total == 0 {
            0.0
        } else {
            self.active as f64 / total as f64
        }
    }

    fn admit_host_words(&mut self, now: Tick) {
        while self.ingress.has_capacity() {
            match self.host.pop_front() {
                Some(word) => self.ingress.send(now, word),
                None => break,
            }
        }
    }

    fn step(
        &mut self,
        now: Tick,
        start_cycle: bool,
        channels: &mut [Channel<Word>],
        shared: &StepShared,
        observers: &mut Observers,
    ) {
        self.release_delayed(now);
        self.transmit(now, channels);
        match self.process {
            Process::Blocked(direction)
                if self.outputs[direction.index()].pending(BYPASS) == 0 =>
            {
                self.process = Process::Receive
            }
            Process::Responding(direction)
                if self.outputs[direction.index()].pending(LOCAL) < self.local_limit =>
            {
                self.process = Process::Receive
            }
            _ => {}
        }
        if let Process::Receive = self.process {
            match self.receive(now, channels) {
                Some(word) => {
                    self.active += 1;
                    self.handle(now, word, shared, observers);
                }
                None => self.idle += 1,
            }
        } else {
            self.active += 1;
        }
        let mut emitted = Vec::new();
        let (id, limit, outputs) = (self.id, self.local_limit, &self.outputs);
        self.engine.tick_with(start_cycle, &mut emitted, |signals| {
            has_local_room(id, limit, outputs, signals)
        });
        observers.emissions += emitted.len();
        for message in emitted.iter() {
            self.send_local(now, message, shared, observers);
        }
    }

    fn release_delayed(&mut self, now: Tick) {
        let elapsed = matches!(self.process, Process::Delay { until, .. } if until <= now);
        if !elapsed {
            return;
        }
        if let Process::Delay {
            direction, word, ..
        } = std::mem::replace(&mut self.process, Process::Receive)
        {
            self.outputs[direction.index()].offer(BYPASS, word);
            self.process = Process::Blocked(direction);
        }
    }

    fn transmit(&mut self, now: Tick, channels: &mut [Channel<Word>]) {
        for &direction in Direction::ALL.iter() {
            let combiner = &mut self.outputs[direction.index()];
            if combiner.is_empty() {
                continue;
            }
            let channel = match self.outbound[direction.index()] {
                Some(channel) => &mut channels[channel],
                None => {
                    log::error!("node {}: words queued on missing {} port", self.id, direction);
                    continue;
                }
            };
            if let Some((source, word)) = combiner.pop(channel.has_capacity()) {
                if cfg!(feature = "trace-channel-words") {
                    trace!(
                        "node {}: {} {} word {:b}",
                        self.id,
                        direction,
                        if source == BYPASS { "bypass" } else { "local" },
                        word
                    );
                }
                channel.send(now, word);
            }
        }
    }

    fn receive(&mut self, now: Tick, channels: &mut [Channel<Word>]) -> Option<Word> {
        let inbound = self.inbound;
        let source = {
            let ingress = &self.ingress;
            let links: &[Channel<Word>] = channels;
            self.inbound_arbiter.arbitrate(|source| {
                if source == INGRESS {
                    ingress.peek(now).is_some()
                } else {
                    inbound[source].map_or(false, |c| links[c].peek(now).is_some())
                }
            })?
        };
        let word = if source == INGRESS {
            self.ingress.receive(now)
        } else {
            inbound[source].and_then(|c| channels[c].receive(now))
        };
        self.inbound_arbiter.accept();
        word
    }

    fn handle(&mut self, now: Tick, word: Word, shared: &StepShared, observers: &mut Observers) {
        match self.decoder.decide(&word) {
            Err(error) => observers.drop_word(now, Some(self.id), error, word),
            Ok(Decision::Forward(direction)) => {
                trace!("node {}: bypass {}", self.id, direction);
                observers.route(RouteEvent::Forwarded {
                    step: now,
                    at: self.id,
                    direction,
                });
                self.process = Process::Delay {
                    until: now + shared.processing_delay,
                    direction,
                    word,
                };
            }
            Ok(Decision::Consume(header, payload)) => {
                observers.route(RouteEvent::Consumed {
                    step: now,
                    at: self.id,
                    command: header.command,
                });
                match dispatch(self.engine.state_mut(), &payload, &shared.context) {
                    Ok(Some(response)) => {
                        self.send_local(now, &response, shared, observers);
                        if let Route::Forward(direction) = route(self.id, response.target) {
                            if self.outputs[direction.index()].pending(LOCAL) >= self.local_limit
                            {
                                self.process = Process::Responding(direction);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(error) => observers.drop_word(now, Some(self.id), error, word),
                }
            }
        }
    }

    /// Queue a message this node originates. Messages to itself are applied
    /// without a network hop.
    fn send_local(
        &mut self,
        now: Tick,
        message: &Message,
        shared: &StepShared,
        observers: &mut Observers,
    ) {
        let word = match shared.layout.encode_message(message) {
            Ok(word) => word,
            Err(error) => {
                let empty = BitVec::<usize, Lsb0>::new().into_boxed_bitslice();
                observers.drop_word(now, Some(self.id), error.into(), empty);
                return;
            }
        };
        match route(self.id, message.target) {
            Route::Local => {
                observers.route(RouteEvent::Consumed {
                    step: now,
                    at: self.id,
                    command: message.payload.command(),
                });
                let state = self.engine.state_mut();
                if let Err(error) = dispatch(state, &message.payload, &shared.context) {
                    observers.drop_word(now, Some(self.id), error, word);
                }
            }
            Route::Forward(direction) => self.outputs[direction.index()].offer(LOCAL, word),
        }
    }
}

/// Whether every port `signals` leave through can queue them. An empty
/// local queue accepts any fan-out.
fn has_local_room(
    id: NodeId,
    limit: usize,
    outputs: &[Combiner<Word>],
    signals: &[Message],
) -> bool {
    let mut wanted = [0usize; 4];
    for signal in signals {
        if let Route::Forward(direction) = route(id, signal.target) {
            wanted[direction.index()] += 1;
        }
    }
    Direction::ALL.iter().all(|direction| {
        let wanted = wanted[direction.index()];
        let pending = outputs[direction.index()].pending(LOCAL);
        wanted == 0 || pending == 0 || pending + wanted <= limit
    })
}

/// A `rows x columns` grid of nodes plus one aggregator per column on the
/// egress row below it.
///
/// Each call to [`Mesh::step`] advances every node process, channel and
/// aggregator by one time unit.
pub struct Mesh {
    config: MeshConfiguration,
    layout: WireLayout,
    topology: Topology,
    nodes: Vec<MeshNode>,
    /// Neighbor links by edge index, followed by one egress link per column.
    channels: Vec<Channel<Word>>,
    aggregators: Vec<Aggregator>,
    /// Catch-all sink for egress traffic no aggregator consumed.
    egress: Vec<Word>,
    publications: Vec<Publication>,
    responder: Box<dyn ResponseStrategy>,
    observers: Observers,
    rng: Xoshiro256StarStar,
    now: Tick,
}

impl Mesh {
    pub fn new(config: MeshConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let layout = config.wire_layout();
        let topology = Topology::new(config.rows, config.columns);
        let link_count = topology.link_count();
        let channels = (0..link_count + config.columns)
            .map(|_| Channel::from_config(&config.channel))
            .collect::<Vec<_>>();
        let mut nodes = topology
            .ids()
            .map(|id| MeshNode::new(id, &config))
            .collect::<Vec<_>>();
        for node in nodes.iter_mut() {
            for &direction in Direction::ALL.iter() {
                let d = direction.index();
                node.outbound[d] = topology.outbound(node.id, direction).map(|e| e.index());
                node.inbound[d] = topology.inbound(node.id, direction).map(|e| e.index());
            }
            if node.id.row + 1 == config.rows {
                node.outbound[Direction::South.index()] = Some(link_count + node.id.column);
            }
        }
        let aggregators = (0..config.columns)
            .map(|column| {
                Aggregator::new(
                    NodeId::new(config.rows, column),
                    config.egress.max_outputs,
                    layout,
                )
            })
            .collect();
        let seed = match config.egress.selection {
            TargetSelection::Random { seed } => seed,
            TargetSelection::Column => DEFAULT_SEED,
        };
        debug!(
            "mesh {}x{}: {}-bit words, {:?}",
            config.rows,
            config.columns,
            layout.width(),
            config.protocol
        );
        Ok(Self {
            responder: Box::new(DeviceParameters::from_config(&config)),
            config,
            layout,
            topology,
            nodes,
            channels,
            aggregators,
            egress: Vec::new(),
            publications: Vec::new(),
            observers: Observers {
                diagnostics: None,
                routes: None,
                dropped: 0,
                emissions: 0,
            },
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            now: 0,
        })
    }

    /// Answer read-only CONTROL parameters with `responder`.
    pub fn with_responder(mut self, responder: Box<dyn ResponseStrategy>) -> Self {
        self.responder = responder;
        self
    }

    /// Report dropped words to `sink`.
    pub fn with_diagnostics(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.observers.diagnostics = Some(sink);
        self
    }

    /// Record every forward and local consumption from now on.
    pub fn trace_routes(&mut self, enable: bool) {
        self.observers.routes = if enable { Some(Vec::new()) } else { None };
    }

    pub fn routes(&self) -> &[RouteEvent] {
        self.observers.routes.as_deref().unwrap_or(&[])
    }

    pub fn config(&self) -> &MeshConfiguration {
        &self.config
    }

    pub fn layout(&self) -> &WireLayout {
        &self.layout
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn dropped(&self) -> usize {
        self.observers.dropped
    }

    fn node_index(&self, id: NodeId) -> Result<usize, Error> {
        if !self.topology.contains(id) {
            return Err(AddressError::Node(id).into());
        }
        Ok(self.topology.index(id))
    }

    pub fn node(&self, id: NodeId) -> Option<&Engine> {
        let index = self.node_index(id).ok()?;
        Some(&self.nodes[index].engine)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Engine> {
        let index = self.node_index(id).ok()?;
        Some(&mut self.nodes[index].engine)
    }

    /// `active / (active + idle)` over the run so far.
    pub fn utilization(&self, id: NodeId) -> Option<f64> {
        let index = self.node_index(id).ok()?;
        Some(self.nodes[index].utilization())
    }

    pub fn aggregator(&self, column: usize) -> Option<&Aggregator> {
        self.aggregators.get(column)
    }

    pub fn publications(&self) -> &[Publication] {
        &self.publications
    }

    pub fn egress(&self) -> &[Word] {
        &self.egress
    }

    /// Install a compiled design on one node.
    pub fn load(
        &mut self,
        id: NodeId,
        instructions: &[Instruction],
        loopback: u64,
        outputs: &[Vec<OutputMapping>],
    ) -> Result<(), Error> {
        let index = self.node_index(id)?;
        self.nodes[index]
            .engine
            .state_mut()
            .load(&self.config, instructions, loopback, outputs)
    }

    pub fn inject(&mut self, at: NodeId, message: &Message) -> Result<(), Error> {
        let word = self.layout.encode_message(message)?;
        self.inject_word(at, word)
    }

    /// Hand a raw word to the ingress of node `at`. The target in the word
    /// is not checked here; out-of-range targets are dropped by the mesh.
    pub fn inject_word(&mut self, at: NodeId, word: Word) -> Result<(), Error> {
        let index = self.node_index(at)?;
        if word.len() != self.layout.width() {
            return Err(ProtocolError::WidthMismatch {
                expected: self.layout.width(),
                actual: word.len(),
            }
            .into());
        }
        self.nodes[index].host.push_back(word);
        Ok(())
    }

    /// No engine is running and no word is in flight anywhere.
    pub fn is_idle(&self) -> bool {
        self.nodes.iter().all(|n| n.is_idle()) && self.channels.iter().all(|c| c.is_empty())
    }

    pub fn step(&mut self, start_cycle: bool, callbacks: &mut SimulationCallbacks) {
        let now = self.now;
        let shared = StepShared {
            layout: &self.layout,
            context: DispatchContext::new(&self.config, self.responder.as_ref()),
            processing_delay: self.config.node.processing_delay,
        };
        for node in self.nodes.iter_mut() {
            node.admit_host_words(now);
            node.step(now, start_cycle, &mut self.channels, &shared, &mut self.observers);
        }
        self.deliver_egress(now);
        let mesh: &Mesh = self;
        callbacks.vcd(|writer| VcdWriter::record(writer, now as u64, mesh));
        self.now += 1;
    }

    /// Move at most one word per column from the egress links into the
    /// aggregators.
    fn deliver_egress(&mut self, now: Tick) {
        let link_count = self.topology.link_count();
        for column in 0..self.config.columns {
            let word = match self.channels[link_count + column].receive(now) {
                Some(word) => word,
                None => continue,
            };
            let target = match self.config.egress.selection {
                TargetSelection::Column => self
                    .layout
                    .peek_target(&word)
                    .map(|t| t.column)
                    .ok()
                    .filter(|&c| c < self.config.columns)
                    .unwrap_or(column),
                TargetSelection::Random { .. } => self.rng.gen_range(0..self.config.columns),
            };
            let aggregator = &mut self.aggregators[target];
            match aggregator.accept(&word) {
                Ok(Aggregated::Published(state)) => {
                    debug!("aggregator {}: published {:b}", aggregator.scope(), state);
                    self.publications.push(Publication {
                        step: now,
                        scope: aggregator.scope(),
                        state,
                    });
                }
                Ok(Aggregated::Unchanged) => {}
                Ok(Aggregated::Passthrough) => self.egress.push(word),
                Err(error) => self.observers.drop_word(now, None, error.into(), word),
            }
        }
    }

    /// Step without asserting `start_cycle` until nothing is left to do.
    pub fn run_until_idle(
        &mut self,
        max_steps: usize,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<usize, Error> {
        let mut steps = 0;
        while !self.is_idle() {
            if steps >= max_steps {
                return Err(Error::Stalled { steps });
            }
            self.step(false, callbacks);
            steps += 1;
        }
        Ok(steps)
    }

    /// Run one compute cycle: assert `start_cycle` once, then step until
    /// every engine is back in CAPTURE and the network has drained.
    pub fn run_cycle(
        &mut self,
        max_steps: usize,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<usize, Error> {
        self.step(true, callbacks);
        let steps = self
            .run_until_idle(max_steps.saturating_sub(1), callbacks)
            .map_err(|e| match e {
                Error::Stalled { steps } => Error::Stalled { steps: steps + 1 },
                other => other,
            })?;
        Ok(steps + 1)
    }

    /// Run `cycles` compute cycles; returns the steps taken.
    pub fn run(
        &mut self,
        cycles: usize,
        max_steps: usize,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<usize, Error> {
        let mut total = 0;
        for _ in 0..cycles {
            total += self.run_cycle(max_steps, callbacks)?;
        }
        Ok(total)
    }

    /// Run cycles until one of them produces no output SIGNAL, i.e. the
    /// design has reached a fixed point. Returns the cycles taken.
    pub fn settle(
        &mut self,
        max_cycles: usize,
        max_steps: usize,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<usize, Error> {
        let start = self.now;
        for cycle in 1..=max_cycles {
            let before = self.observers.emissions;
            self.run_cycle(max_steps, callbacks)?;
            if self.observers.emissions == before {
                return Ok(cycle);
            }
        }
        Err(Error::Stalled {
            steps: self.now - start,
        })
    }

    /// Step without asserting `start_cycle` until time `deadline`.
    pub fn run_until(&mut self, deadline: Tick, callbacks: &mut SimulationCallbacks) {
        while self.now < deadline {
            self.step(false, callbacks);
        }
    }
}

impl VcdComponent for Mesh {
    fn vcd_write_scope(&self, writer: Rc<RefCell<VcdWriter>>) {
        writer.borrow_mut().add_integer_var("step");
        let pc_bits = bit_size(self.config.node.instruction_capacity).max(1);
        for node in self.nodes.iter() {
            let scope = format!("node_{}_{}", node.id.row, node.id.column);
            let _scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), &scope);
            let mut w = writer.borrow_mut();
            w.add_integer_var("cycle");
            w.add_wire(pc_bits, "pc");
            w.add_wire(1, "run");
            w.add_wire(self.config.node.inputs, "captured");
            w.add_wire(self.config.node.outputs, "outputs");
        }
        for aggregator in self.aggregators.iter() {
            let scope = format!("aggregator_{}", aggregator.scope().column);
            let _scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), &scope);
            writer
                .borrow_mut()
                .add_wire(self.config.egress.max_outputs, "state");
        }
    }

    fn vcd_record(&self, writer: Rc<RefCell<VcdWriter>>) {
        writer
            .borrow_mut()
            .change_value("step", self.now as u64, 64);
        let pc_bits = bit_size(self.config.node.instruction_capacity).max(1);
        for node in self.nodes.iter() {
            let scope = format!("node_{}_{}", node.id.row, node.id.column);
            let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), &scope);
            let mut w = writer.borrow_mut();
            let engine = &node.engine;
            w.change_value("cycle", engine.cycle(), 64);
            w.change_value("pc", engine.pc() as u64, pc_bits);
            w.change_value("run", (engine.phase() == Phase::Run) as u64, 1);
            w.change_bits("captured", engine.state().captured());
            w.change_bits("outputs", engine.state().outputs());
        }
        for aggregator in self.aggregators.iter() {
            let scope = format!("aggregator_{}", aggregator.scope().column);
            let _scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), &scope);
            writer.borrow_mut().change_bits("state", aggregator.state());
        }
    }
}
