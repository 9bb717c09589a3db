//! Network compiler - one pass over the graph, three kernels out
//!
//! Walks layers in activation order and hands every neuron to the per-neuron
//! compiler. Feed and trace fragments concatenate in traversal order (a
//! neuron's feed statements must see its upstream activations from the same
//! pass); train fragments concatenate in reverse, so a hidden neuron reads
//! the error responsibilities its downstream neurons computed in the same
//! pass.

use crate::error::{ForgeError, Result};
use crate::graph::Network;
use crate::vm::neuron::{CompiledNeuron, Role};
use crate::vm::sentence::KernelSentence;
use crate::vm::unrolled::UnrolledNetwork;
use crate::vm::variables::TrainingContext;

/// Flatten a network into an [`UnrolledNetwork`]
///
/// The graph is only read, never owned: compilation snapshots every scalar
/// of interest into the variable table and the original network is no longer
/// needed for evaluation afterwards.
pub fn compile(network: &Network) -> Result<UnrolledNetwork> {
    network.validate()?;

    let mut ctx = TrainingContext::new();
    let mut fragments = Vec::with_capacity(network.neuron_count());
    let last = network.layers().len() - 1;
    for (li, layer) in network.layers().iter().enumerate() {
        for &n in layer {
            let role = if li == 0 {
                Role::Input
            } else if li == last {
                Role::Output
            } else if network.neuron(n).frozen {
                Role::Frozen
            } else {
                Role::Hidden
            };
            fragments.push(CompiledNeuron::build(&mut ctx, network, n, role));
        }
    }

    let mut feed = KernelSentence::new();
    let mut trace = KernelSentence::new();
    let mut train = KernelSentence::new();
    for fragment in &fragments {
        feed.append(&fragment.feed);
        trace.append(&fragment.trace);
    }
    for fragment in fragments.iter().rev() {
        train.append(&fragment.train);
    }

    let rate = ctx
        .rate()
        .ok_or_else(|| ForgeError::Compilation("no rate slot was allocated".into()))?;
    Ok(UnrolledNetwork::from_compile(ctx, feed, trace, train, rate))
}
