//! Network - layered graph construction, prefab builders, reference evaluator
//!
//! The network owns two arenas (neurons, connections) and a list of layers in
//! activation order: the first layer is the input layer, the last the output
//! layer. Wiring goes through the methods here so the gating bookkeeping
//! (gated lists, neighbours, extended traces, influences) stays consistent.
//!
//! `feed`/`train` evaluate the graph directly. They perform the same
//! arithmetic, in the same operand grouping and the same traversal order, as
//! the kernels emitted by [`crate::vm::compile`] - feed and trace passes walk
//! neurons in activation order, the weight-update pass walks them in reverse.
//! Keeping the two evaluation paths in lockstep is what makes compiled and
//! uncompiled networks agree to the last bit.

use crate::error::{ForgeError, Result};
use crate::graph::neuron::{ConnIdx, Connection, Neuron, NeuronIdx};
use crate::ids::Id;
use crate::math;
use crate::vm::UnrolledNetwork;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Index of a layer, in activation order
pub type LayerId = usize;

/// Layered recurrent network of sigmoid neurons
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Network {
    neurons: Vec<Neuron>,
    connections: Vec<Connection>,
    layers: Vec<Vec<NeuronIdx>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Append a layer of `size` neurons with zero biases
    pub fn add_layer(&mut self, size: usize) -> LayerId {
        let mut layer = Vec::with_capacity(size);
        for _ in 0..size {
            layer.push(self.push_neuron(0.0));
        }
        self.layers.push(layer);
        self.layers.len() - 1
    }

    /// Append a layer of `size` neurons with biases drawn uniformly from [-0.1, 0.1)
    pub fn add_layer_with_rng<R: Rng>(&mut self, size: usize, rng: &mut R) -> LayerId {
        let mut layer = Vec::with_capacity(size);
        for _ in 0..size {
            layer.push(self.push_neuron(rng.gen::<f64>() * 0.2 - 0.1));
        }
        self.layers.push(layer);
        self.layers.len() - 1
    }

    fn push_neuron(&mut self, bias: f64) -> NeuronIdx {
        let mut neuron = Neuron::new();
        neuron.data.bias = bias;
        self.neurons.push(neuron);
        self.neurons.len() - 1
    }

    /// Connect two distinct neurons with an explicit weight
    pub fn connect_with_weight(
        &mut self,
        from: NeuronIdx,
        to: NeuronIdx,
        weight: f64,
    ) -> Result<ConnIdx> {
        self.check_neuron(from)?;
        self.check_neuron(to)?;
        if from == to {
            return Err(ForgeError::GraphInvariant(
                "use self_connect for recurrent self-connections".into(),
            ));
        }
        let conn_id = Id::generate();
        self.connections.push(Connection {
            id: conn_id,
            source: from,
            target: to,
            gate: None,
            weight,
            gain: 1.0,
        });
        let idx = self.connections.len() - 1;
        self.neurons[from].outgoing.push(idx);
        let target = &mut self.neurons[to];
        target.incoming.push(idx);
        target.eligibility.insert(conn_id, 0.0);
        // the target may already gate other neurons; every extended trace map
        // is keyed by the target's incoming connections, so grow them all
        for xtrace in target.extended.values_mut() {
            xtrace.insert(conn_id, 0.0);
        }
        Ok(idx)
    }

    /// Connect two neurons with a weight drawn uniformly from [-0.1, 0.1)
    pub fn connect_with_rng<R: Rng>(
        &mut self,
        from: NeuronIdx,
        to: NeuronIdx,
        rng: &mut R,
    ) -> Result<ConnIdx> {
        let weight = rng.gen::<f64>() * 0.2 - 0.1;
        self.connect_with_weight(from, to, weight)
    }

    /// Connect two neurons with a random weight
    pub fn connect(&mut self, from: NeuronIdx, to: NeuronIdx) -> Result<ConnIdx> {
        self.connect_with_rng(from, to, &mut rand::thread_rng())
    }

    /// All-to-all wiring between two layers, random weights
    pub fn connect_layers(&mut self, from: LayerId, to: LayerId) -> Result<()> {
        self.connect_layers_with_rng(from, to, &mut rand::thread_rng())
    }

    /// All-to-all wiring between two layers with a caller-supplied generator
    pub fn connect_layers_with_rng<R: Rng>(
        &mut self,
        from: LayerId,
        to: LayerId,
        rng: &mut R,
    ) -> Result<()> {
        let sources = self.layer_checked(from)?.to_vec();
        let targets = self.layer_checked(to)?.to_vec();
        for &s in &sources {
            for &t in &targets {
                self.connect_with_rng(s, t, rng)?;
            }
        }
        Ok(())
    }

    /// Give a neuron a recurrent self-connection
    pub fn self_connect(&mut self, neuron: NeuronIdx, weight: f64) -> Result<ConnIdx> {
        self.check_neuron(neuron)?;
        if self.neurons[neuron].self_connection.is_some() {
            return Err(ForgeError::GraphInvariant(format!(
                "neuron {} is already self-connected",
                self.neurons[neuron].id
            )));
        }
        self.connections.push(Connection {
            id: Id::generate(),
            source: neuron,
            target: neuron,
            gate: None,
            weight,
            gain: 1.0,
        });
        let idx = self.connections.len() - 1;
        self.neurons[neuron].self_connection = Some(idx);
        Ok(idx)
    }

    /// Let `gater` gate a connection: the gater's activation drives the
    /// connection's gain, and the gater starts tracking extended traces for
    /// the connection's target
    pub fn gate(&mut self, gater: NeuronIdx, conn: ConnIdx) -> Result<()> {
        self.check_neuron(gater)?;
        self.check_connection(conn)?;
        if self.connections[conn].gate.is_some() {
            return Err(ForgeError::GraphInvariant(format!(
                "connection {} is already gated",
                self.connections[conn].id
            )));
        }
        self.connections[conn].gate = Some(gater);
        let target = self.connections[conn].target;
        let target_id = self.neurons[target].id;
        let incoming_ids: Vec<Id> = self.neurons[gater]
            .incoming
            .iter()
            .map(|&c| self.connections[c].id)
            .collect();
        let g = &mut self.neurons[gater];
        g.gated.push(conn);
        if !g.extended.contains_key(&target_id) {
            g.neighbours.insert(target_id, target);
            let xtrace = incoming_ids.iter().map(|&id| (id, 0.0)).collect();
            g.extended.insert(target_id, xtrace);
        }
        g.influences.entry(target_id).or_default().push(conn);
        Ok(())
    }

    /// Mark a hidden neuron as frozen: it feeds but never learns
    pub fn freeze(&mut self, neuron: NeuronIdx) -> Result<()> {
        self.check_neuron(neuron)?;
        if self.input_layer().contains(&neuron) || self.output_layer().contains(&neuron) {
            return Err(ForgeError::GraphInvariant(
                "only hidden neurons can be frozen".into(),
            ));
        }
        self.neurons[neuron].frozen = true;
        Ok(())
    }

    // =========================================================================
    // Prefabs
    // =========================================================================

    /// Fully-connected feed-forward network: input, hidden layers, output
    pub fn feed_forward(inputs: usize, hidden: &[usize], outputs: usize) -> Result<Self> {
        Self::feed_forward_with_rng(&mut rand::thread_rng(), inputs, hidden, outputs)
    }

    /// `feed_forward` with a caller-supplied generator
    pub fn feed_forward_with_rng<R: Rng>(
        rng: &mut R,
        inputs: usize,
        hidden: &[usize],
        outputs: usize,
    ) -> Result<Self> {
        let mut net = Self::new();
        let mut prev = net.add_layer(inputs);
        for &size in hidden {
            let layer = net.add_layer_with_rng(size, rng);
            net.connect_layers_with_rng(prev, layer, rng)?;
            prev = layer;
        }
        let out = net.add_layer_with_rng(outputs, rng);
        net.connect_layers_with_rng(prev, out, rng)?;
        Ok(net)
    }

    /// LSTM network: per block an input gate, forget gate, memory cell and
    /// output gate layer, activated in that order
    ///
    /// Input connections into each cell are gated by the block's input gate,
    /// the cell's unit self-connection by its forget gate, and the last
    /// block's projection to the output layer by its output gate. Cells feed
    /// all three gate layers back through ungated peephole connections.
    pub fn long_short_term_memory(
        inputs: usize,
        blocks: &[usize],
        outputs: usize,
    ) -> Result<Self> {
        Self::long_short_term_memory_with_rng(&mut rand::thread_rng(), inputs, blocks, outputs)
    }

    /// `long_short_term_memory` with a caller-supplied generator
    pub fn long_short_term_memory_with_rng<R: Rng>(
        rng: &mut R,
        inputs: usize,
        blocks: &[usize],
        outputs: usize,
    ) -> Result<Self> {
        let mut net = Self::new();
        let mut prev = net.add_layer(inputs);
        let mut last_block: Option<(Vec<NeuronIdx>, Vec<NeuronIdx>)> = None;
        for &size in blocks {
            let input_gate = net.add_layer_with_rng(size, rng);
            let forget_gate = net.add_layer_with_rng(size, rng);
            let memory_cell = net.add_layer_with_rng(size, rng);
            let output_gate = net.add_layer_with_rng(size, rng);

            net.connect_layers_with_rng(prev, input_gate, rng)?;
            net.connect_layers_with_rng(prev, forget_gate, rng)?;
            net.connect_layers_with_rng(prev, output_gate, rng)?;

            let sources = net.layer(prev).to_vec();
            let igates = net.layer(input_gate).to_vec();
            let fgates = net.layer(forget_gate).to_vec();
            let ogates = net.layer(output_gate).to_vec();
            let cells = net.layer(memory_cell).to_vec();

            for (i, &cell) in cells.iter().enumerate() {
                for &s in &sources {
                    let conn = net.connect_with_rng(s, cell, rng)?;
                    net.gate(igates[i], conn)?;
                }
                let self_conn = net.self_connect(cell, 1.0)?;
                net.gate(fgates[i], self_conn)?;
            }

            // peepholes: cells feed the gates their previous-step activation
            net.connect_layers_with_rng(memory_cell, input_gate, rng)?;
            net.connect_layers_with_rng(memory_cell, forget_gate, rng)?;
            net.connect_layers_with_rng(memory_cell, output_gate, rng)?;

            prev = memory_cell;
            last_block = Some((cells, ogates));
        }
        let out = net.add_layer_with_rng(outputs, rng);
        match last_block {
            Some((cells, ogates)) => {
                let targets = net.layer(out).to_vec();
                for (i, &cell) in cells.iter().enumerate() {
                    for &t in &targets {
                        let conn = net.connect_with_rng(cell, t, rng)?;
                        net.gate(ogates[i], conn)?;
                    }
                }
            }
            None => net.connect_layers_with_rng(prev, out, rng)?,
        }
        Ok(net)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn neuron(&self, idx: NeuronIdx) -> &Neuron {
        &self.neurons[idx]
    }

    pub fn neuron_mut(&mut self, idx: NeuronIdx) -> &mut Neuron {
        &mut self.neurons[idx]
    }

    pub fn connection(&self, idx: ConnIdx) -> &Connection {
        &self.connections[idx]
    }

    pub fn connection_mut(&mut self, idx: ConnIdx) -> &mut Connection {
        &mut self.connections[idx]
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn layers(&self) -> &[Vec<NeuronIdx>] {
        &self.layers
    }

    pub fn layer(&self, layer: LayerId) -> &[NeuronIdx] {
        &self.layers[layer]
    }

    pub fn input_layer(&self) -> &[NeuronIdx] {
        self.layers.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn output_layer(&self) -> &[NeuronIdx] {
        self.layers.last().map(Vec::as_slice).unwrap_or(&[])
    }

    fn check_neuron(&self, idx: NeuronIdx) -> Result<()> {
        if idx >= self.neurons.len() {
            return Err(ForgeError::GraphInvariant(format!(
                "neuron index {idx} out of range"
            )));
        }
        Ok(())
    }

    fn check_connection(&self, idx: ConnIdx) -> Result<()> {
        if idx >= self.connections.len() {
            return Err(ForgeError::GraphInvariant(format!(
                "connection index {idx} out of range"
            )));
        }
        Ok(())
    }

    fn layer_checked(&self, layer: LayerId) -> Result<&[NeuronIdx]> {
        self.layers
            .get(layer)
            .map(Vec::as_slice)
            .ok_or_else(|| ForgeError::GraphInvariant(format!("layer {layer} out of range")))
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check the structural invariants the compiler relies on
    pub fn validate(&self) -> Result<()> {
        if self.layers.len() < 2 {
            return Err(ForgeError::GraphInvariant(
                "network needs at least an input and an output layer".into(),
            ));
        }
        if self.input_layer().is_empty() || self.output_layer().is_empty() {
            return Err(ForgeError::GraphInvariant(
                "input and output layers must be non-empty".into(),
            ));
        }
        for (idx, conn) in self.connections.iter().enumerate() {
            if conn.source >= self.neurons.len() || conn.target >= self.neurons.len() {
                return Err(ForgeError::GraphInvariant(format!(
                    "connection {} references a missing neuron",
                    conn.id
                )));
            }
            if conn.source == conn.target {
                if self.neurons[conn.source].self_connection != Some(idx) {
                    return Err(ForgeError::GraphInvariant(format!(
                        "self-connection {} is not registered on its neuron",
                        conn.id
                    )));
                }
            } else {
                if !self.neurons[conn.source].outgoing.contains(&idx) {
                    return Err(ForgeError::GraphInvariant(format!(
                        "connection {} is missing from its source's outgoing list",
                        conn.id
                    )));
                }
                if !self.neurons[conn.target].incoming.contains(&idx) {
                    return Err(ForgeError::GraphInvariant(format!(
                        "connection {} is missing from its target's incoming list",
                        conn.id
                    )));
                }
                if !self.neurons[conn.target].eligibility.contains_key(&conn.id) {
                    return Err(ForgeError::GraphInvariant(format!(
                        "connection {} has no eligibility trace on its target",
                        conn.id
                    )));
                }
            }
            if let Some(gater) = conn.gate {
                if gater >= self.neurons.len() {
                    return Err(ForgeError::GraphInvariant(format!(
                        "connection {} is gated by a missing neuron",
                        conn.id
                    )));
                }
                let g = &self.neurons[gater];
                let target_id = self.neurons[conn.target].id;
                let tracked = g.gated.contains(&idx)
                    && g.neighbours.get(&target_id) == Some(&conn.target)
                    && g.extended.contains_key(&target_id)
                    && g.influences
                        .get(&target_id)
                        .is_some_and(|conns| conns.contains(&idx));
                if !tracked {
                    return Err(ForgeError::GraphInvariant(format!(
                        "gating bookkeeping for connection {} is inconsistent",
                        conn.id
                    )));
                }
            }
        }
        for neuron in &self.neurons {
            for (neighbour_id, xtrace) in &neuron.extended {
                if !neuron.neighbours.contains_key(neighbour_id) {
                    return Err(ForgeError::GraphInvariant(format!(
                        "neuron {} extends {} without a neighbour reference",
                        neuron.id, neighbour_id
                    )));
                }
                for &conn in &neuron.incoming {
                    if !xtrace.contains_key(&self.connections[conn].id) {
                        return Err(ForgeError::GraphInvariant(format!(
                            "neuron {} has no extended trace for incoming connection {}",
                            neuron.id, self.connections[conn].id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Reference evaluator
    // =========================================================================

    /// Forward pass: set input activations, activate every other neuron in
    /// activation order, return the output layer's activations
    pub fn feed(&mut self, inputs: &[f64]) -> Result<Vec<f64>> {
        let input_layer = self.input_layer().to_vec();
        if inputs.len() != input_layer.len() {
            return Err(ForgeError::ShapeMismatch {
                expected: input_layer.len(),
                actual: inputs.len(),
            });
        }
        for (&idx, &value) in input_layer.iter().zip(inputs) {
            self.neurons[idx].data.activation = value;
        }
        for layer in 1..self.layers.len() {
            for i in 0..self.layers[layer].len() {
                let n = self.layers[layer][i];
                self.activate(n);
            }
        }
        Ok(self
            .output_layer()
            .iter()
            .map(|&idx| self.neurons[idx].data.activation)
            .collect())
    }

    /// Backward pass for the most recent `feed`: update eligibility and
    /// extended traces (activation order), then responsibilities, weights and
    /// biases (reverse activation order)
    pub fn train(&mut self, rate: f64, targets: &[f64]) -> Result<()> {
        let output_layer = self.output_layer().to_vec();
        if targets.len() != output_layer.len() {
            return Err(ForgeError::ShapeMismatch {
                expected: output_layer.len(),
                actual: targets.len(),
            });
        }
        for layer in 1..self.layers.len() {
            for i in 0..self.layers[layer].len() {
                let n = self.layers[layer][i];
                if !self.neurons[n].frozen {
                    self.update_traces(n);
                }
            }
        }
        let flat: Vec<NeuronIdx> = self.layers.iter().flatten().copied().collect();
        let input_len = self.input_layer().len();
        for &n in flat.iter().rev().take(flat.len() - input_len) {
            if self.neurons[n].frozen {
                continue;
            }
            let target = output_layer
                .iter()
                .position(|&o| o == n)
                .map(|pos| targets[pos]);
            self.propagate(n, rate, target);
        }
        Ok(())
    }

    fn activate(&mut self, n: NeuronIdx) {
        let mut state = self.neurons[n].data.state;
        self.neurons[n].data.old_state = state;
        let bias = self.neurons[n].data.bias;
        match self.neurons[n].self_connection {
            Some(sc) => {
                let c = &self.connections[sc];
                if c.gate.is_some() {
                    state = state * c.weight;
                    state = state * c.gain;
                    state += bias;
                } else {
                    state = c.weight * state + bias;
                }
            }
            None => state = bias,
        }
        let incoming = self.neurons[n].incoming.clone();
        for conn in incoming {
            let c = &self.connections[conn];
            let input_activation = self.neurons[c.source].data.activation;
            if c.gate.is_some() {
                state += input_activation * c.weight * c.gain;
            } else {
                state += input_activation * c.weight;
            }
        }
        let activation = math::sigmoid(state);
        let data = &mut self.neurons[n].data;
        data.state = state;
        data.activation = activation;
        data.derivative = activation * (1.0 - activation);
        let gated = self.neurons[n].gated.clone();
        for conn in gated {
            self.connections[conn].gain = activation;
        }
    }

    /// Influence of this neuron on a gated neighbour: the neighbour's old
    /// state if the neighbour's self-connection is gated here, plus the
    /// weighted activations flowing through every connection gated here
    fn influence_on(&self, n: NeuronIdx, neighbour_id: Id) -> f64 {
        let neuron = &self.neurons[n];
        let neighbour = &self.neurons[neuron.neighbours[&neighbour_id]];
        let mut influence = 0.0;
        let mut initialized = false;
        if let Some(sc) = neighbour.self_connection {
            if self.connections[sc].gate == Some(n) {
                influence = neighbour.data.old_state;
                initialized = true;
            }
        }
        for &conn in &neuron.influences[&neighbour_id] {
            let c = &self.connections[conn];
            let term = c.weight * self.neurons[c.source].data.activation;
            if initialized {
                influence += term;
            } else {
                influence = term;
                initialized = true;
            }
        }
        influence
    }

    fn update_traces(&mut self, n: NeuronIdx) {
        let (has_self, self_gated, self_weight, self_gain) = match self.neurons[n].self_connection
        {
            Some(sc) => {
                let c = &self.connections[sc];
                (true, c.gate.is_some(), c.weight, c.gain)
            }
            None => (false, false, 0.0, 0.0),
        };
        let derivative = self.neurons[n].data.derivative;
        let influences: Vec<(Id, f64)> = self.neurons[n]
            .extended
            .keys()
            .map(|&id| (id, self.influence_on(n, id)))
            .collect();
        let incoming = self.neurons[n].incoming.clone();
        for conn in incoming {
            let c = &self.connections[conn];
            let conn_id = c.id;
            let input_gated = c.gate.is_some();
            let input_gain = c.gain;
            let input_activation = self.neurons[c.source].data.activation;
            let mut eligibility = self.neurons[n].eligibility[&conn_id];
            if has_self {
                if self_gated {
                    eligibility = eligibility * self_weight;
                    eligibility = eligibility * self_gain;
                    if input_gated {
                        eligibility += input_gain * input_activation;
                    } else {
                        eligibility += input_activation;
                    }
                } else if input_gated {
                    eligibility = eligibility * self_weight;
                    eligibility += input_gain * input_activation;
                } else {
                    eligibility = self_weight * eligibility + input_activation;
                }
            } else if input_gated {
                eligibility = input_gain * input_activation;
            } else {
                eligibility = input_activation;
            }
            self.neurons[n].eligibility.insert(conn_id, eligibility);
            for &(neighbour_id, influence) in &influences {
                let xtrace = self.neurons[n].extended[&neighbour_id][&conn_id];
                let updated = if has_self {
                    let mut x = xtrace * self_weight;
                    if self_gated {
                        x = x * self_gain;
                    }
                    x + derivative * eligibility * influence
                } else {
                    derivative * eligibility * influence
                };
                if let Some(map) = self.neurons[n].extended.get_mut(&neighbour_id) {
                    map.insert(conn_id, updated);
                }
            }
        }
    }

    fn propagate(&mut self, n: NeuronIdx, rate: f64, target: Option<f64>) {
        let derivative = self.neurons[n].data.derivative;
        let responsibility;
        if let Some(target) = target {
            responsibility = target - self.neurons[n].data.activation;
            self.neurons[n].data.error_responsibility = responsibility;
            let incoming = self.neurons[n].incoming.clone();
            for conn in incoming {
                let eligibility = self.neurons[n].eligibility[&self.connections[conn].id];
                self.connections[conn].weight += rate * responsibility * eligibility;
            }
        } else if self.neurons[n].gated.is_empty() {
            // plain hidden neuron: only projected error
            let mut acc = 0.0;
            for &conn in &self.neurons[n].outgoing {
                let c = &self.connections[conn];
                let output_responsibility = self.neurons[c.target].data.error_responsibility;
                if c.gate.is_some() {
                    acc += output_responsibility * c.gain * c.weight;
                } else {
                    acc += output_responsibility * c.weight;
                }
            }
            acc *= derivative;
            responsibility = acc;
            self.neurons[n].data.error_responsibility = responsibility;
            let incoming = self.neurons[n].incoming.clone();
            for conn in incoming {
                let eligibility = self.neurons[n].eligibility[&self.connections[conn].id];
                self.connections[conn].weight += rate * responsibility * eligibility;
            }
        } else if self.neurons[n].outgoing.is_empty() {
            // pure gater: only gated error
            let mut acc = 0.0;
            let neighbour_ids: Vec<Id> = self.neurons[n].extended.keys().copied().collect();
            for &neighbour_id in &neighbour_ids {
                let influence = self.influence_on(n, neighbour_id);
                let neighbour = self.neurons[n].neighbours[&neighbour_id];
                acc += self.neurons[neighbour].data.error_responsibility * influence;
            }
            acc *= derivative;
            responsibility = acc;
            self.neurons[n].data.error_responsibility = responsibility;
            let incoming = self.neurons[n].incoming.clone();
            for conn in incoming {
                let conn_id = self.connections[conn].id;
                let mut gradient = 0.0;
                for &neighbour_id in &neighbour_ids {
                    let neighbour = self.neurons[n].neighbours[&neighbour_id];
                    gradient += self.neurons[neighbour].data.error_responsibility
                        * self.neurons[n].extended[&neighbour_id][&conn_id];
                }
                self.connections[conn].weight += rate * gradient;
            }
        } else {
            // projecting gater: projected and gated error
            let mut acc = 0.0;
            for &conn in &self.neurons[n].outgoing {
                let c = &self.connections[conn];
                let output_responsibility = self.neurons[c.target].data.error_responsibility;
                if c.gate.is_some() {
                    acc += output_responsibility * c.gain * c.weight;
                } else {
                    acc += output_responsibility * c.weight;
                }
            }
            let projected = derivative * acc;
            acc = 0.0;
            let neighbour_ids: Vec<Id> = self.neurons[n].extended.keys().copied().collect();
            for &neighbour_id in &neighbour_ids {
                let influence = self.influence_on(n, neighbour_id);
                let neighbour = self.neurons[n].neighbours[&neighbour_id];
                acc += self.neurons[neighbour].data.error_responsibility * influence;
            }
            let gating = derivative * acc;
            responsibility = projected + gating;
            let data = &mut self.neurons[n].data;
            data.projected_activity = projected;
            data.gating_activity = gating;
            data.error_responsibility = responsibility;
            let incoming = self.neurons[n].incoming.clone();
            for conn in incoming {
                let conn_id = self.connections[conn].id;
                let mut gradient = projected * self.neurons[n].eligibility[&conn_id];
                for &neighbour_id in &neighbour_ids {
                    let neighbour = self.neurons[n].neighbours[&neighbour_id];
                    gradient += self.neurons[neighbour].data.error_responsibility
                        * self.neurons[n].extended[&neighbour_id][&conn_id];
                }
                self.connections[conn].weight += rate * gradient;
            }
        }
        self.neurons[n].data.bias += rate * responsibility;
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    /// Flatten this network into an [`UnrolledNetwork`]
    pub fn compile(&self) -> Result<UnrolledNetwork> {
        crate::vm::compile(self)
    }
}
