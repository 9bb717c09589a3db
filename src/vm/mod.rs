//! Rnnforge VM - recurrent networks as straight-line kernel programs
//!
//! Instead of walking the pointer-linked neuron graph on every pass, a
//! network is visited once at compile time: every scalar of interest gets a
//! slot in one contiguous buffer, and three flat programs are emitted over
//! those slots.
//!
//! ```text
//! inputs → [input slots] → feed kernel → [activation/state slots] → outputs
//!                                            ↓
//!                   targets → [target slots] → train kernel → [weight/bias slots]
//!                                            ↑
//!                                trace kernel (eligibility)
//! ```
//!
//! At evaluation time only the buffer and the programs are touched; the
//! object graph can be dropped, kept for inspection, or refreshed later via
//! [`UnrolledNetwork::restore_into`].
//!
//! ## Example
//!
//! ```ignore
//! use rnnforge::{compile, Network};
//!
//! let mut network = Network::feed_forward(2, &[20], 1)?;
//! let mut vm = compile(&network)?;
//!
//! let output = vm.feed(&[0.0, 1.0])?;
//! vm.train(0.25, &[1.0])?;
//! ```

mod binary;
mod compiler;
mod neuron;
mod sentence;
mod unrolled;
mod variables;

pub use binary::{
    deserialize, load_from_file, save_to_file, serialize, HEADER_SIZE, KERNEL_MAGIC,
    KERNEL_VERSION,
};
pub use compiler::compile;
pub use neuron::Role;
pub use sentence::{KernelSentence, Op, Slot};
pub use unrolled::UnrolledNetwork;
pub use variables::{TrainingContext, VarKey, VarRole};
