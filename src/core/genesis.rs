//! Genesis block construction
//!
//! Every network starts from a block with one coinbase transaction whose
//! input script carries the launch topic. The merkle root of a single
//! transaction is its txid, so the header can be rebuilt from the coinbase
//! alone.

use crate::consensus::target::CompactTarget;
use crate::core::block::{write_compact_size, BlockHeader};
use crate::crypto::{calculate_merkle_root, BlockHash};
use bytes::BufMut;
use num_bigint::BigUint;

/// Base units per coin
pub const COIN: i64 = 100_000_000;

/// Smallest subsidy step
pub const CENT: i64 = 1_000_000;

/// Message embedded in every genesis coinbase
pub const GENESIS_TOPIC: &str = "https://bitcointalk.org/index.php?topic=325735.0";

/// Number pushed ahead of the topic in the coinbase script
const GENESIS_SCRIPT_NUMBER: i64 = 999;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;

/// Push the minimal script-number encoding of `value`
fn push_script_number(script: &mut Vec<u8>, value: i64) {
    let mut bytes = Vec::new();
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    if let Some(last) = bytes.last_mut() {
        if *last & 0x80 != 0 {
            bytes.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *last |= 0x80;
        }
    }
    push_data(script, &bytes);
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    }
    script.extend_from_slice(data);
}

/// Input script of the genesis coinbase: `OP_0 <999> <topic>`
pub fn genesis_coinbase_script(topic: &str) -> Vec<u8> {
    let mut script = vec![OP_0];
    push_script_number(&mut script, GENESIS_SCRIPT_NUMBER);
    push_data(&mut script, topic.as_bytes());
    script
}

/// Serialized genesis coinbase transaction
///
/// Version 1, a single null-prevout input, one output of `reward` with an
/// empty script, lock time 0 and an empty data payload.
pub fn genesis_coinbase(topic: &str, reward: i64) -> Vec<u8> {
    let script_sig = genesis_coinbase_script(topic);
    let mut tx = Vec::with_capacity(128);

    tx.put_i32_le(1);
    write_compact_size(&mut tx, 1);
    tx.put_slice(&[0u8; 32]);
    tx.put_u32_le(u32::MAX);
    write_compact_size(&mut tx, script_sig.len() as u64);
    tx.put_slice(&script_sig);
    tx.put_u32_le(u32::MAX);

    write_compact_size(&mut tx, 1);
    tx.put_i64_le(reward);
    write_compact_size(&mut tx, 0);

    tx.put_u32_le(0);
    // data payload
    write_compact_size(&mut tx, 0);
    tx
}

/// Build a genesis header for the given launch parameters
pub fn create_genesis_header(
    time: u32,
    nonce: u32,
    bits: CompactTarget,
    version: i32,
    multiplier: u64,
) -> BlockHeader {
    let coinbase = genesis_coinbase(GENESIS_TOPIC, COIN);
    BlockHeader {
        version,
        prev_block: BlockHash::zero(),
        merkle_root: calculate_merkle_root(&[BlockHash::of(&coinbase)]),
        time,
        bits,
        nonce,
        prime_chain_multiplier: BigUint::from(multiplier),
    }
}
