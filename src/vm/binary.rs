//! Binary serialization for compiled networks
//!
//! A persisted kernel is everything the VM needs to keep evaluating and
//! training: the three sentences, the buffer snapshot, and the slot lists.
//!
//! ## Binary Format
//!
//! ```text
//! HEADER (36 bytes)
//! ├── Magic:     "URNN" (4 bytes)
//! ├── Version:   u16 (format version)
//! ├── Reserved:  u16
//! ├── FeedLen:   u32 (feed statement count)
//! ├── TraceLen:  u32 (trace statement count)
//! ├── TrainLen:  u32 (train statement count)
//! ├── MemoryLen: u32 (buffer slot count)
//! ├── InputLen:  u32
//! ├── OutputLen: u32
//! └── TargetLen: u32
//!
//! PAYLOAD (in this order)
//! ├── Feed statements   (opcode u8 + operand u32s, f64 for literals)
//! ├── Trace statements
//! ├── Train statements
//! ├── Buffer snapshot   (MemoryLen * f64, IEEE 754 little-endian)
//! ├── Input slots       (InputLen * u32)
//! ├── Output slots      (OutputLen * u32)
//! ├── Target slots      (TargetLen * u32)
//! └── Rate slot         (u32)
//! ```
//!
//! Everything is little-endian. Portability across hosts holds as long as
//! both sides use IEEE 754 doubles, which the statement semantics assume
//! anyway.

use crate::vm::sentence::{KernelSentence, Op, Slot};
use crate::vm::unrolled::UnrolledNetwork;
use anyhow::{Context, Result};
use std::io::{Read, Write};

/// Magic bytes for persisted kernels
pub const KERNEL_MAGIC: [u8; 4] = [0x55, 0x52, 0x4E, 0x4E]; // "URNN"

/// Current version of the binary format
pub const KERNEL_VERSION: u16 = 0x0001;

/// Header size in bytes
pub const HEADER_SIZE: usize = 36;

const OP_SET: u8 = 0x00;
const OP_IMM: u8 = 0x01;
const OP_ADD: u8 = 0x02;
const OP_SUB: u8 = 0x03;
const OP_MUL: u8 = 0x04;
const OP_ADD_ASSIGN: u8 = 0x05;
const OP_MUL_ASSIGN: u8 = 0x06;
const OP_MUL_ACC: u8 = 0x07;
const OP_MUL_ACC3: u8 = 0x08;
const OP_MUL_ADD: u8 = 0x09;
const OP_SIGMOID: u8 = 0x0A;
const OP_SIGMOID_DERIV: u8 = 0x0B;

fn write_slot(buf: &mut Vec<u8>, slot: Slot) {
    buf.extend_from_slice(&slot.0.to_le_bytes());
}

fn serialize_sentence(buf: &mut Vec<u8>, sentence: &KernelSentence) {
    for op in sentence.ops() {
        match *op {
            Op::Set { dst, src } => {
                buf.push(OP_SET);
                write_slot(buf, dst);
                write_slot(buf, src);
            }
            Op::Imm { dst, value } => {
                buf.push(OP_IMM);
                write_slot(buf, dst);
                buf.extend_from_slice(&value.to_le_bytes());
            }
            Op::Add { dst, a, b } => {
                buf.push(OP_ADD);
                write_slot(buf, dst);
                write_slot(buf, a);
                write_slot(buf, b);
            }
            Op::Sub { dst, a, b } => {
                buf.push(OP_SUB);
                write_slot(buf, dst);
                write_slot(buf, a);
                write_slot(buf, b);
            }
            Op::Mul { dst, a, b } => {
                buf.push(OP_MUL);
                write_slot(buf, dst);
                write_slot(buf, a);
                write_slot(buf, b);
            }
            Op::AddAssign { dst, src } => {
                buf.push(OP_ADD_ASSIGN);
                write_slot(buf, dst);
                write_slot(buf, src);
            }
            Op::MulAssign { dst, src } => {
                buf.push(OP_MUL_ASSIGN);
                write_slot(buf, dst);
                write_slot(buf, src);
            }
            Op::MulAcc { dst, a, b } => {
                buf.push(OP_MUL_ACC);
                write_slot(buf, dst);
                write_slot(buf, a);
                write_slot(buf, b);
            }
            Op::MulAcc3 { dst, a, b, c } => {
                buf.push(OP_MUL_ACC3);
                write_slot(buf, dst);
                write_slot(buf, a);
                write_slot(buf, b);
                write_slot(buf, c);
            }
            Op::MulAdd { dst, a, b, c } => {
                buf.push(OP_MUL_ADD);
                write_slot(buf, dst);
                write_slot(buf, a);
                write_slot(buf, b);
                write_slot(buf, c);
            }
            Op::Sigmoid { dst, src } => {
                buf.push(OP_SIGMOID);
                write_slot(buf, dst);
                write_slot(buf, src);
            }
            Op::SigmoidDeriv { dst, src } => {
                buf.push(OP_SIGMOID_DERIV);
                write_slot(buf, dst);
                write_slot(buf, src);
            }
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset + n > self.data.len() {
            anyhow::bail!(
                "unexpected end of data at offset {} (need {} more bytes)",
                self.offset,
                n
            );
        }
        let bytes = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into()?))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into()?))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn read_slot(&mut self) -> Result<Slot> {
        Ok(Slot(self.read_u32()?))
    }
}

fn deserialize_sentence(reader: &mut Reader<'_>, count: usize) -> Result<KernelSentence> {
    let mut sentence = KernelSentence::new();
    for i in 0..count {
        let opcode = reader
            .read_u8()
            .with_context(|| format!("statement {i} truncated"))?;
        let dst = reader.read_slot()?;
        let op = match opcode {
            OP_SET => Op::Set {
                dst,
                src: reader.read_slot()?,
            },
            OP_IMM => Op::Imm {
                dst,
                value: reader.read_f64()?,
            },
            OP_ADD => Op::Add {
                dst,
                a: reader.read_slot()?,
                b: reader.read_slot()?,
            },
            OP_SUB => Op::Sub {
                dst,
                a: reader.read_slot()?,
                b: reader.read_slot()?,
            },
            OP_MUL => Op::Mul {
                dst,
                a: reader.read_slot()?,
                b: reader.read_slot()?,
            },
            OP_ADD_ASSIGN => Op::AddAssign {
                dst,
                src: reader.read_slot()?,
            },
            OP_MUL_ASSIGN => Op::MulAssign {
                dst,
                src: reader.read_slot()?,
            },
            OP_MUL_ACC => Op::MulAcc {
                dst,
                a: reader.read_slot()?,
                b: reader.read_slot()?,
            },
            OP_MUL_ACC3 => Op::MulAcc3 {
                dst,
                a: reader.read_slot()?,
                b: reader.read_slot()?,
                c: reader.read_slot()?,
            },
            OP_MUL_ADD => Op::MulAdd {
                dst,
                a: reader.read_slot()?,
                b: reader.read_slot()?,
                c: reader.read_slot()?,
            },
            OP_SIGMOID => Op::Sigmoid {
                dst,
                src: reader.read_slot()?,
            },
            OP_SIGMOID_DERIV => Op::SigmoidDeriv {
                dst,
                src: reader.read_slot()?,
            },
            other => anyhow::bail!("unknown opcode 0x{other:02X} in statement {i}"),
        };
        sentence.push(op);
    }
    Ok(sentence)
}

fn check_slots(sentence: &KernelSentence, memory_len: usize, name: &str) -> Result<()> {
    for op in sentence.ops() {
        if op.dst().index() >= memory_len {
            anyhow::bail!(
                "{name} kernel writes slot {} but the buffer has {} slots",
                op.dst(),
                memory_len
            );
        }
    }
    Ok(())
}

/// Serialize a compiled network to the binary kernel format
pub fn serialize(network: &UnrolledNetwork) -> Vec<u8> {
    let mut payload = Vec::new();
    serialize_sentence(&mut payload, network.feed_kernel());
    serialize_sentence(&mut payload, network.trace_kernel());
    serialize_sentence(&mut payload, network.train_kernel());
    for &value in network.memory() {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    for &slot in network.input_slots() {
        payload.extend_from_slice(&slot.0.to_le_bytes());
    }
    for &slot in network.output_slots() {
        payload.extend_from_slice(&slot.0.to_le_bytes());
    }
    for &slot in network.target_slots() {
        payload.extend_from_slice(&slot.0.to_le_bytes());
    }
    payload.extend_from_slice(&network.rate_slot().0.to_le_bytes());

    let mut output = Vec::with_capacity(HEADER_SIZE + payload.len());
    output.extend_from_slice(&KERNEL_MAGIC);
    output.extend_from_slice(&KERNEL_VERSION.to_le_bytes());
    output.extend_from_slice(&0u16.to_le_bytes());
    output.extend_from_slice(&(network.feed_kernel().len() as u32).to_le_bytes());
    output.extend_from_slice(&(network.trace_kernel().len() as u32).to_le_bytes());
    output.extend_from_slice(&(network.train_kernel().len() as u32).to_le_bytes());
    output.extend_from_slice(&(network.memory().len() as u32).to_le_bytes());
    output.extend_from_slice(&(network.input_slots().len() as u32).to_le_bytes());
    output.extend_from_slice(&(network.output_slots().len() as u32).to_le_bytes());
    output.extend_from_slice(&(network.target_slots().len() as u32).to_le_bytes());
    output.extend(payload);
    output
}

/// Deserialize a binary kernel back into a runnable VM
pub fn deserialize(data: &[u8]) -> Result<UnrolledNetwork> {
    let mut reader = Reader::new(data);
    let magic: [u8; 4] = reader.take(4).context("header truncated")?.try_into()?;
    if magic != KERNEL_MAGIC {
        anyhow::bail!("invalid magic: expected URNN, got {magic:?}");
    }
    let version = reader.read_u16()?;
    if version != KERNEL_VERSION {
        anyhow::bail!("unsupported format version {version}");
    }
    let _reserved = reader.read_u16()?;
    let feed_len = reader.read_u32()? as usize;
    let trace_len = reader.read_u32()? as usize;
    let train_len = reader.read_u32()? as usize;
    let memory_len = reader.read_u32()? as usize;
    let input_len = reader.read_u32()? as usize;
    let output_len = reader.read_u32()? as usize;
    let target_len = reader.read_u32()? as usize;

    let feed = deserialize_sentence(&mut reader, feed_len).context("feed kernel")?;
    let trace = deserialize_sentence(&mut reader, trace_len).context("trace kernel")?;
    let train = deserialize_sentence(&mut reader, train_len).context("train kernel")?;

    let mut memory = Vec::with_capacity(memory_len);
    for _ in 0..memory_len {
        memory.push(reader.read_f64()?);
    }
    let mut read_slots = |count: usize| -> Result<Vec<Slot>> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let slot = reader.read_slot()?;
            if slot.index() >= memory_len {
                anyhow::bail!("slot {slot} out of range for a {memory_len}-slot buffer");
            }
            slots.push(slot);
        }
        Ok(slots)
    };
    let inputs = read_slots(input_len)?;
    let outputs = read_slots(output_len)?;
    let targets = read_slots(target_len)?;
    let rate = read_slots(1)?[0];

    check_slots(&feed, memory_len, "feed")?;
    check_slots(&trace, memory_len, "trace")?;
    check_slots(&train, memory_len, "train")?;

    Ok(UnrolledNetwork::from_parts(
        feed, trace, train, memory, inputs, outputs, targets, rate,
    ))
}

/// Save a compiled network to a binary file
pub fn save_to_file(network: &UnrolledNetwork, path: impl AsRef<std::path::Path>) -> Result<()> {
    let binary = serialize(network);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&binary)?;
    Ok(())
}

/// Load a compiled network from a binary file
pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<UnrolledNetwork> {
    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    deserialize(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Network;
    use crate::vm::compile;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn compiled_fixture() -> UnrolledNetwork {
        let mut rng = StdRng::seed_from_u64(21);
        let net = Network::feed_forward_with_rng(&mut rng, 2, &[3], 1).unwrap();
        compile(&net).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let mut original = compiled_fixture();
        let binary = serialize(&original);
        let mut recovered = deserialize(&binary).unwrap();

        assert_eq!(original.feed_kernel(), recovered.feed_kernel());
        assert_eq!(original.trace_kernel(), recovered.trace_kernel());
        assert_eq!(original.train_kernel(), recovered.train_kernel());
        assert_eq!(original.memory(), recovered.memory());
        assert_eq!(original.input_slots(), recovered.input_slots());
        assert_eq!(original.rate_slot(), recovered.rate_slot());

        // a recovered kernel keeps evaluating and training
        let before = original.feed(&[0.3, 0.7]).unwrap();
        let after = recovered.feed(&[0.3, 0.7]).unwrap();
        assert_eq!(before, after);
        recovered.train(0.25, &[1.0]).unwrap();
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut binary = serialize(&compiled_fixture());
        binary[0] ^= 0xFF;
        assert!(deserialize(&binary).is_err());
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let binary = serialize(&compiled_fixture());
        assert!(deserialize(&binary[..binary.len() / 2]).is_err());
    }

    #[test]
    fn test_out_of_range_slot_is_rejected() {
        let net = compiled_fixture();
        let mut binary = serialize(&net);
        // shrink the declared buffer so every slot reference lands outside it
        binary[20..24].copy_from_slice(&1u32.to_le_bytes());
        assert!(deserialize(&binary).is_err());
    }
}
