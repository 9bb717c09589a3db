//! Neuron and Connection - arena records of the object graph

use crate::ids::Id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index into the network's neuron arena
pub type NeuronIdx = usize;

/// Index into the network's connection arena
pub type ConnIdx = usize;

/// Mutable per-neuron training scalars
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NeuronData {
    pub bias: f64,
    pub state: f64,
    pub old_state: f64,
    pub activation: f64,
    pub derivative: f64,
    pub error_responsibility: f64,
    pub projected_activity: f64,
    pub gating_activity: f64,
}

/// Directed weighted link between two neurons, optionally gated by a third
///
/// Gated connections carry a gain that the gate neuron overwrites with its
/// own activation on every feed pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub id: Id,
    pub source: NeuronIdx,
    pub target: NeuronIdx,
    pub gate: Option<NeuronIdx>,
    pub weight: f64,
    pub gain: f64,
}

/// A sigmoid unit with internal state and real-time recurrent learning traces
///
/// All id-keyed maps are BTreeMaps: the compiler walks them during emission
/// and the kernel byte stream must not depend on hash order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Neuron {
    pub id: Id,
    pub data: NeuronData,
    /// Recurrent connection to self, kept out of incoming/outgoing
    pub self_connection: Option<ConnIdx>,
    pub incoming: Vec<ConnIdx>,
    pub outgoing: Vec<ConnIdx>,
    /// Connections this neuron gates
    pub gated: Vec<ConnIdx>,
    /// Eligibility trace per incoming connection id
    pub eligibility: BTreeMap<Id, f64>,
    /// Extended traces: gated-neighbour id -> incoming connection id -> trace
    pub extended: BTreeMap<Id, BTreeMap<Id, f64>>,
    /// Gated-neighbour id -> arena index
    pub neighbours: BTreeMap<Id, NeuronIdx>,
    /// Gated-neighbour id -> connections into that neighbour gated by this neuron
    pub influences: BTreeMap<Id, Vec<ConnIdx>>,
    /// Frozen neurons feed but never learn
    pub frozen: bool,
}

impl Neuron {
    pub fn new() -> Self {
        Self {
            id: Id::generate(),
            data: NeuronData::default(),
            self_connection: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            gated: Vec::new(),
            eligibility: BTreeMap::new(),
            extended: BTreeMap::new(),
            neighbours: BTreeMap::new(),
            influences: BTreeMap::new(),
            frozen: false,
        }
    }

    pub fn is_self_connected(&self) -> bool {
        self.self_connection.is_some()
    }
}

impl Default for Neuron {
    fn default() -> Self {
        Self::new()
    }
}
