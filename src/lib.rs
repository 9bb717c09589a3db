//! # Rnnforge - Compile-Ahead Recurrent Networks
//!
//! A recurrent neural network library whose distinguishing idea is
//! ahead-of-time compilation: a trained (or freshly wired) network graph is
//! flattened once into three straight-line kernel programs - *feed*, *trace*,
//! *train* - over a single contiguous scalar buffer. After compilation, a
//! forward or training pass touches only the buffer and the program, never
//! the graph.
//!
//! ## Core Components
//!
//! - **Network**: layered object graph of sigmoid neurons with optional
//!   self-connections and multiplicative gating; doubles as the reference
//!   evaluator
//! - **compile / UnrolledNetwork**: the graph-to-kernel compiler and the VM
//!   that interprets the emitted programs
//! - **TrainingContext**: the shared variable table mapping symbolic keys to
//!   buffer slots
//! - **Binary format**: persisted kernels (sentences + buffer + slot lists)
//!
//! Learning is real-time recurrent learning in the LSTM tradition:
//! eligibility traces per connection, extended eligibility traces for gating
//! neurons, error responsibilities split into projected and gating activity.
//!
//! ## Example
//!
//! ```ignore
//! use rnnforge::{compile, Network};
//!
//! let mut network = Network::feed_forward(2, &[20], 1)?;
//! let mut vm = compile(&network)?;
//!
//! for _ in 0..2500 {
//!     vm.feed(&[0.0, 1.0])?;
//!     vm.train(0.25, &[1.0])?;
//! }
//!
//! // hand the learned state back to the object layer
//! vm.restore_into(&mut network);
//! ```

// Object layer - graph construction and the reference evaluator
pub mod graph;
pub use graph::{Connection, Neuron, NeuronData, Network};

// Kernel compiler and virtual machine
pub mod vm;
pub use vm::{
    compile, deserialize, load_from_file, save_to_file, serialize, KernelSentence, Op, Role,
    Slot, TrainingContext, UnrolledNetwork, VarKey, VarRole,
};

// Identifier service
mod ids;
pub use ids::Id;

// Scalar math helpers
pub mod math;

// Error types
mod error;
pub use error::{ForgeError, Result};
