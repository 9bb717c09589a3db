//! UnrolledNetwork - the virtual machine over compiled kernels
//!
//! Owns the flat scalar buffer and the three straight-line programs. A feed
//! writes the input slots, interprets the feed kernel, and reads the output
//! slots; a train step writes rate and targets, then interprets the trace
//! kernel followed by the train kernel. Statements execute strictly in
//! emission order; there is no control flow to speak of.
//!
//! Numerical trouble (overflow, NaN) is not trapped - it flows through the
//! buffer like any other value.

use crate::error::{ForgeError, Result};
use crate::graph::Network;
use crate::ids::Id;
use crate::math;
use crate::vm::sentence::{KernelSentence, Op, Slot};
use crate::vm::variables::{TrainingContext, VarKey, VarRole};

/// A compiled network: buffer, kernels, and the slot lists that form its API
#[derive(Debug, Clone)]
pub struct UnrolledNetwork {
    context: TrainingContext,
    memory: Vec<f64>,
    feed: KernelSentence,
    trace: KernelSentence,
    train: KernelSentence,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    targets: Vec<Slot>,
    rate: Slot,
}

impl UnrolledNetwork {
    pub(crate) fn from_compile(
        context: TrainingContext,
        feed: KernelSentence,
        trace: KernelSentence,
        train: KernelSentence,
        rate: Slot,
    ) -> Self {
        Self {
            memory: context.snapshot_initial_values(),
            inputs: context.inputs().to_vec(),
            outputs: context.outputs().to_vec(),
            targets: context.targets().to_vec(),
            rate,
            feed,
            trace,
            train,
            context,
        }
    }

    /// Rebuild from persisted parts. The symbol bindings are gone at this
    /// point, so [`Self::evaluate`] and [`Self::restore_into`] fall back to
    /// the caller-supplied defaults for every key.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        feed: KernelSentence,
        trace: KernelSentence,
        train: KernelSentence,
        memory: Vec<f64>,
        inputs: Vec<Slot>,
        outputs: Vec<Slot>,
        targets: Vec<Slot>,
        rate: Slot,
    ) -> Self {
        Self {
            context: TrainingContext::new(),
            memory,
            feed,
            trace,
            train,
            inputs,
            outputs,
            targets,
            rate,
        }
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Forward pass: write the input slots, run the feed kernel, read the
    /// output slots. Fails before touching the buffer on a length mismatch.
    pub fn feed(&mut self, inputs: &[f64]) -> Result<Vec<f64>> {
        if inputs.len() != self.inputs.len() {
            return Err(ForgeError::ShapeMismatch {
                expected: self.inputs.len(),
                actual: inputs.len(),
            });
        }
        for (slot, &value) in self.inputs.iter().zip(inputs) {
            self.memory[slot.index()] = value;
        }
        run(&self.feed, &mut self.memory);
        Ok(self
            .outputs
            .iter()
            .map(|slot| self.memory[slot.index()])
            .collect())
    }

    /// One training step against the most recent feed: write rate and
    /// targets, update traces, then apply weight and bias updates
    pub fn train(&mut self, rate: f64, targets: &[f64]) -> Result<()> {
        if targets.len() != self.targets.len() {
            return Err(ForgeError::ShapeMismatch {
                expected: self.targets.len(),
                actual: targets.len(),
            });
        }
        self.memory[self.rate.index()] = rate;
        for (slot, &value) in self.targets.iter().zip(targets) {
            self.memory[slot.index()] = value;
        }
        run(&self.trace, &mut self.memory);
        run(&self.train, &mut self.memory);
        Ok(())
    }

    // =========================================================================
    // State access
    // =========================================================================

    /// Read one scalar by its symbolic key, or `fallback` if the key is
    /// unknown to this instance
    pub fn evaluate(&self, key: &VarKey, fallback: f64) -> f64 {
        self.context.evaluate(&self.memory, key, fallback)
    }

    /// Copy the buffer's current values back into an object graph: training
    /// data, eligibility and extended traces, and the weights and gains of
    /// self and outgoing connections. Keys this instance never allocated
    /// leave the object values untouched.
    pub fn restore_into(&self, network: &mut Network) {
        for idx in 0..network.neuron_count() {
            let id = network.neuron(idx).id;
            let data = network.neuron(idx).data.clone();
            let bias = self.evaluate(&VarKey::of(id, VarRole::Bias), data.bias);
            let state = self.evaluate(&VarKey::of(id, VarRole::State), data.state);
            let old_state = self.evaluate(&VarKey::of(id, VarRole::OldState), data.old_state);
            let activation = self.evaluate(&VarKey::of(id, VarRole::Activation), data.activation);
            {
                let data = &mut network.neuron_mut(idx).data;
                data.bias = bias;
                data.state = state;
                data.old_state = old_state;
                data.activation = activation;
            }

            let conn_ids: Vec<Id> = network.neuron(idx).eligibility.keys().copied().collect();
            for conn_id in conn_ids {
                let current = network.neuron(idx).eligibility[&conn_id];
                let restored = self.evaluate(
                    &VarKey::pair(id, conn_id, VarRole::Eligibility),
                    current,
                );
                network.neuron_mut(idx).eligibility.insert(conn_id, restored);
            }

            let neighbour_ids: Vec<Id> = network.neuron(idx).extended.keys().copied().collect();
            for nb_id in neighbour_ids {
                let conn_ids: Vec<Id> =
                    network.neuron(idx).extended[&nb_id].keys().copied().collect();
                for conn_id in conn_ids {
                    let current = network.neuron(idx).extended[&nb_id][&conn_id];
                    let restored = self.evaluate(
                        &VarKey::triple(id, nb_id, conn_id, VarRole::ExtendedTrace),
                        current,
                    );
                    if let Some(xtrace) = network.neuron_mut(idx).extended.get_mut(&nb_id) {
                        xtrace.insert(conn_id, restored);
                    }
                }
            }

            let mut conns = network.neuron(idx).outgoing.clone();
            conns.extend(network.neuron(idx).self_connection);
            for ci in conns {
                let conn = network.connection(ci);
                let weight = self.evaluate(&VarKey::of(conn.id, VarRole::Weight), conn.weight);
                let gain = self.evaluate(&VarKey::of(conn.id, VarRole::Gain), conn.gain);
                let conn = network.connection_mut(ci);
                conn.weight = weight;
                conn.gain = gain;
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn memory(&self) -> &[f64] {
        &self.memory
    }

    pub fn context(&self) -> &TrainingContext {
        &self.context
    }

    pub fn feed_kernel(&self) -> &KernelSentence {
        &self.feed
    }

    pub fn trace_kernel(&self) -> &KernelSentence {
        &self.trace
    }

    pub fn train_kernel(&self) -> &KernelSentence {
        &self.train
    }

    pub fn input_slots(&self) -> &[Slot] {
        &self.inputs
    }

    pub fn output_slots(&self) -> &[Slot] {
        &self.outputs
    }

    pub fn target_slots(&self) -> &[Slot] {
        &self.targets
    }

    pub fn rate_slot(&self) -> Slot {
        self.rate
    }
}

/// Interpret one kernel sentence against the buffer
fn run(kernel: &KernelSentence, memory: &mut [f64]) {
    for op in kernel.ops() {
        match *op {
            Op::Set { dst, src } => memory[dst.index()] = memory[src.index()],
            Op::Imm { dst, value } => memory[dst.index()] = value,
            Op::Add { dst, a, b } => {
                memory[dst.index()] = memory[a.index()] + memory[b.index()]
            }
            Op::Sub { dst, a, b } => {
                memory[dst.index()] = memory[a.index()] - memory[b.index()]
            }
            Op::Mul { dst, a, b } => {
                memory[dst.index()] = memory[a.index()] * memory[b.index()]
            }
            Op::AddAssign { dst, src } => memory[dst.index()] += memory[src.index()],
            Op::MulAssign { dst, src } => memory[dst.index()] *= memory[src.index()],
            Op::MulAcc { dst, a, b } => {
                memory[dst.index()] += memory[a.index()] * memory[b.index()]
            }
            Op::MulAcc3 { dst, a, b, c } => {
                memory[dst.index()] += memory[a.index()] * memory[b.index()] * memory[c.index()]
            }
            Op::MulAdd { dst, a, b, c } => {
                memory[dst.index()] = memory[a.index()] * memory[b.index()] + memory[c.index()]
            }
            Op::Sigmoid { dst, src } => {
                memory[dst.index()] = math::sigmoid(memory[src.index()])
            }
            Op::SigmoidDeriv { dst, src } => {
                let activation = memory[src.index()];
                memory[dst.index()] = activation * (1.0 - activation);
            }
        }
    }
}
