//! Training context - the shared scalar heap behind the kernels
//!
//! Every scalar a kernel touches lives in one dense `f64` buffer. During
//! compilation each scalar is named by a [`VarKey`] (identifiers plus a role
//! tag) and assigned a [`Slot`] on first allocation; later allocations of the
//! same key reuse the slot and keep the first initial value. The context also
//! records which slots the VM exposes as inputs, outputs, targets and the
//! learning rate, in registration order - that order is the public ordering
//! of `feed`'s and `train`'s vectors.
//!
//! Scratch roles (`ErrorAccumulator`, `Gradient`, `Influence` with no ids)
//! collide across neurons on purpose: the train kernel is strictly
//! sequential and every write precedes every read within one fragment, so a
//! single scratch slot serves the whole kernel.

use crate::ids::Id;
use crate::vm::sentence::Slot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role tag, the last element of every variable key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarRole {
    Rate,
    Activation,
    Derivative,
    Bias,
    State,
    OldState,
    Weight,
    Gain,
    Influence,
    Eligibility,
    ExtendedTrace,
    Target,
    ErrorResponsibility,
    ProjectedActivity,
    GatingActivity,
    ErrorAccumulator,
    Gradient,
}

/// Symbolic name of one buffer slot: zero to three identifiers plus a role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarKey {
    ids: Vec<Id>,
    role: VarRole,
}

impl VarKey {
    /// The singular learning-rate key
    pub fn rate() -> Self {
        Self {
            ids: Vec::new(),
            role: VarRole::Rate,
        }
    }

    /// Scratch key: role only, shared across neurons
    pub fn scratch(role: VarRole) -> Self {
        Self {
            ids: Vec::new(),
            role,
        }
    }

    /// Key for a per-neuron or per-connection scalar
    pub fn of(id: Id, role: VarRole) -> Self {
        Self {
            ids: vec![id],
            role,
        }
    }

    /// Key for a (neuron, connection) scalar such as an eligibility trace
    pub fn pair(a: Id, b: Id, role: VarRole) -> Self {
        Self {
            ids: vec![a, b],
            role,
        }
    }

    /// Key for a (neuron, neighbour, connection) scalar: extended traces
    pub fn triple(a: Id, b: Id, c: Id, role: VarRole) -> Self {
        Self {
            ids: vec![a, b, c],
            role,
        }
    }

    pub fn role(&self) -> VarRole {
        self.role
    }
}

/// The variable table shared by all per-neuron compilations
#[derive(Debug, Clone, Default)]
pub struct TrainingContext {
    index: HashMap<VarKey, Slot>,
    values: Vec<f64>,
    roles: Vec<VarRole>,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    targets: Vec<Slot>,
    rate: Option<Slot>,
}

impl TrainingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the slot for `key`, allocating a fresh one initialized to
    /// `initial_value` only if the key is new. A reused key keeps the value
    /// its first allocation supplied.
    pub fn allocate_or_reuse(&mut self, initial_value: f64, key: VarKey) -> Slot {
        if let Some(&slot) = self.index.get(&key) {
            return slot;
        }
        let slot = Slot(self.values.len() as u32);
        self.values.push(initial_value);
        self.roles.push(key.role());
        self.index.insert(key, slot);
        slot
    }

    pub fn register_input(&mut self, slot: Slot) {
        self.inputs.push(slot);
    }

    pub fn register_output(&mut self, slot: Slot) {
        self.outputs.push(slot);
    }

    pub fn register_target(&mut self, slot: Slot) {
        self.targets.push(slot);
    }

    /// Record the learning-rate slot; every neuron registers the same one
    pub fn register_rate(&mut self, slot: Slot) {
        debug_assert!(self.rate.is_none() || self.rate == Some(slot));
        self.rate = Some(slot);
    }

    pub fn slot_of(&self, key: &VarKey) -> Option<Slot> {
        self.index.get(key).copied()
    }

    /// Read a slot's value from `buffer`, or `fallback` if the key was never
    /// allocated
    pub fn evaluate(&self, buffer: &[f64], key: &VarKey, fallback: f64) -> f64 {
        match self.slot_of(key) {
            Some(slot) => buffer[slot.index()],
            None => fallback,
        }
    }

    /// The buffer the VM starts from
    pub fn snapshot_initial_values(&self) -> Vec<f64> {
        self.values.clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn role_of(&self, slot: Slot) -> VarRole {
        self.roles[slot.index()]
    }

    pub fn inputs(&self) -> &[Slot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Slot] {
        &self.outputs
    }

    pub fn targets(&self) -> &[Slot] {
        &self.targets
    }

    pub fn rate(&self) -> Option<Slot> {
        self.rate
    }
}
