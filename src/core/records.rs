//! Prime records
//!
//! Views over the prime chains found by the active chain: the succession of
//! record origins for a chain length, and the largest origins ever found.

use crate::consensus::pow::ChainType;
use crate::crypto::BlockHash;
use crate::storage::BlockIndexNode;
use chrono::{TimeZone, Utc};
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

/// Entries kept by [`top_primes`]
pub const TOP_PRIMES_COUNT: usize = 10;

/// Primes tried when factoring an origin into primorial form
const SMALL_PRIMES: [u32; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// A block whose prime chain is listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeRecord {
    pub time: String,
    pub epoch: i64,
    pub height: u32,
    pub hash: BlockHash,
    pub prime_digits: usize,
    pub prime_chain: String,
    pub prime_origin: String,
    pub primorial_form: String,
}

/// `origin` written as `k*p#`, with `p#` the largest primorial dividing it
pub fn primorial_form(origin: &BigUint) -> String {
    let mut factor = origin.clone();
    let mut last = None;
    if !factor.is_zero() {
        for p in SMALL_PRIMES {
            if !(&factor % p).is_zero() {
                break;
            }
            factor /= p;
            last = Some(p);
        }
    }
    match last {
        Some(p) => format!("{}*{}#", factor, p),
        None => factor.to_string(),
    }
}

fn format_time(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => epoch.to_string(),
    }
}

fn matches(node: &BlockIndexNode, length: u32, chain_type: Option<ChainType>) -> bool {
    match node.prime_chain {
        Some(chain) => {
            chain.length.length() == length && chain_type.map_or(true, |t| t == chain.chain_type)
        }
        None => false,
    }
}

fn record(node: &BlockIndexNode, origin: &BigUint) -> PrimeRecord {
    let digits = origin.to_string();
    PrimeRecord {
        time: format_time(node.time()),
        epoch: node.time(),
        height: node.height,
        hash: node.hash,
        prime_digits: digits.len(),
        prime_chain: node.prime_chain.map(|c| c.name()).unwrap_or_default(),
        prime_origin: digits,
        primorial_form: primorial_form(origin),
    }
}

/// Blocks, in chain order, whose origin beat every earlier origin of a
/// matching chain
pub fn prime_records<'a>(
    nodes: impl IntoIterator<Item = &'a BlockIndexNode>,
    length: u32,
    chain_type: Option<ChainType>,
) -> Vec<PrimeRecord> {
    let mut best = BigUint::zero();
    let mut records = Vec::new();
    for node in nodes {
        if !matches(node, length, chain_type) {
            continue;
        }
        let origin = node.header.prime_origin();
        if origin > best {
            records.push(record(node, &origin));
            best = origin;
        }
    }
    records
}

/// The [`TOP_PRIMES_COUNT`] largest origins of matching chains, largest
/// first. Equal origins keep chain order.
pub fn top_primes<'a>(
    nodes: impl IntoIterator<Item = &'a BlockIndexNode>,
    length: u32,
    chain_type: Option<ChainType>,
) -> Vec<PrimeRecord> {
    let mut found: Vec<(BigUint, &BlockIndexNode)> = nodes
        .into_iter()
        .filter(|node| matches(node, length, chain_type))
        .map(|node| (node.header.prime_origin(), node))
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0));
    found.truncate(TOP_PRIMES_COUNT);
    found
        .iter()
        .map(|(origin, node)| record(node, origin))
        .collect()
}
