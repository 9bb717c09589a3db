//! Kernel sentence - the straight-line IR emitted by the compiler
//!
//! A sentence is an append-only, ordered list of three-address statements
//! over slot indices. Emission order is load-bearing: statements like
//! `old_state = state` only mean anything because they precede the update of
//! `state`, so sentences are never reordered or optimized.
//!
//! ## Statement forms
//!
//! | Op           | Semantics                  |
//! |--------------|----------------------------|
//! | Set          | `dst = src`                |
//! | Imm          | `dst = literal`            |
//! | Add          | `dst = a + b`              |
//! | Sub          | `dst = a - b`              |
//! | Mul          | `dst = a * b`              |
//! | AddAssign    | `dst += src`               |
//! | MulAssign    | `dst *= src`               |
//! | MulAcc       | `dst += a * b`             |
//! | MulAcc3      | `dst += a * b * c`         |
//! | MulAdd       | `dst = a * b + c`          |
//! | Sigmoid      | `dst = 1 / (1 + e^-src)`   |
//! | SigmoidDeriv | `dst = src * (1 - src)`    |
//!
//! Longer right-hand sides (the gated self-connection update, for example)
//! are decomposed by the compiler into `MulAssign` chains, so every statement
//! stays within three source operands.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of one scalar in the VM's contiguous buffer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Slot(pub u32);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One three-address kernel statement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Set { dst: Slot, src: Slot },
    Imm { dst: Slot, value: f64 },
    Add { dst: Slot, a: Slot, b: Slot },
    Sub { dst: Slot, a: Slot, b: Slot },
    Mul { dst: Slot, a: Slot, b: Slot },
    AddAssign { dst: Slot, src: Slot },
    MulAssign { dst: Slot, src: Slot },
    MulAcc { dst: Slot, a: Slot, b: Slot },
    MulAcc3 { dst: Slot, a: Slot, b: Slot, c: Slot },
    MulAdd { dst: Slot, a: Slot, b: Slot, c: Slot },
    Sigmoid { dst: Slot, src: Slot },
    SigmoidDeriv { dst: Slot, src: Slot },
}

impl Op {
    /// The slot this statement writes
    pub fn dst(&self) -> Slot {
        match *self {
            Op::Set { dst, .. }
            | Op::Imm { dst, .. }
            | Op::Add { dst, .. }
            | Op::Sub { dst, .. }
            | Op::Mul { dst, .. }
            | Op::AddAssign { dst, .. }
            | Op::MulAssign { dst, .. }
            | Op::MulAcc { dst, .. }
            | Op::MulAcc3 { dst, .. }
            | Op::MulAdd { dst, .. }
            | Op::Sigmoid { dst, .. }
            | Op::SigmoidDeriv { dst, .. } => dst,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Op::Set { dst, src } => write!(f, "{dst} = {src}"),
            Op::Imm { dst, value } => write!(f, "{dst} = {value}"),
            Op::Add { dst, a, b } => write!(f, "{dst} = {a} + {b}"),
            Op::Sub { dst, a, b } => write!(f, "{dst} = {a} - {b}"),
            Op::Mul { dst, a, b } => write!(f, "{dst} = {a} * {b}"),
            Op::AddAssign { dst, src } => write!(f, "{dst} += {src}"),
            Op::MulAssign { dst, src } => write!(f, "{dst} *= {src}"),
            Op::MulAcc { dst, a, b } => write!(f, "{dst} += {a} * {b}"),
            Op::MulAcc3 { dst, a, b, c } => write!(f, "{dst} += {a} * {b} * {c}"),
            Op::MulAdd { dst, a, b, c } => write!(f, "{dst} = {a} * {b} + {c}"),
            Op::Sigmoid { dst, src } => write!(f, "{dst} = sigmoid({src})"),
            Op::SigmoidDeriv { dst, src } => write!(f, "{dst} = {src} * (1 - {src})"),
        }
    }
}

/// Ordered, append-only sequence of kernel statements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelSentence {
    ops: Vec<Op>,
}

impl KernelSentence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Append another sentence, preserving its order
    pub fn append(&mut self, other: &KernelSentence) {
        self.ops.extend_from_slice(&other.ops);
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl fmt::Display for KernelSentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.ops {
            writeln!(f, "{op}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut a = KernelSentence::new();
        a.push(Op::Imm {
            dst: Slot(0),
            value: 1.0,
        });
        let mut b = KernelSentence::new();
        b.push(Op::Set {
            dst: Slot(1),
            src: Slot(0),
        });
        b.push(Op::AddAssign {
            dst: Slot(1),
            src: Slot(0),
        });
        a.append(&b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.ops()[1].dst(), Slot(1));
    }

    #[test]
    fn test_display() {
        let mut sentence = KernelSentence::new();
        sentence.push(Op::MulAcc3 {
            dst: Slot(4),
            a: Slot(1),
            b: Slot(2),
            c: Slot(3),
        });
        sentence.push(Op::Sigmoid {
            dst: Slot(5),
            src: Slot(4),
        });
        let text = sentence.to_string();
        assert!(text.contains("v4 += v1 * v2 * v3"));
        assert!(text.contains("v5 = sigmoid(v4)"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut sentence = KernelSentence::new();
        sentence.push(Op::Imm {
            dst: Slot(2),
            value: 0.25,
        });
        sentence.push(Op::MulAdd {
            dst: Slot(3),
            a: Slot(0),
            b: Slot(3),
            c: Slot(2),
        });
        let json = serde_json::to_string(&sentence).unwrap();
        let restored: KernelSentence = serde_json::from_str(&json).unwrap();
        assert_eq!(sentence, restored);
    }
}
