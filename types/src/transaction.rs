//! Confidential transaction container.
//!
//! The orchestrator never looks inside commitments or range proofs — those
//! belong to the Processor. What it does need is enough structure for
//! pooling and dandelion aggregation: kernels with fees and height bounds,
//! input/output counts, fingerprints, and a way to merge two transactions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::block::{Height, HeightRange};
use crate::hash::TxFingerprint;

/// Flat per-element size estimates used for pool byte accounting and
/// fee-rate computation. The wire encoding is close enough to these.
const INPUT_WEIGHT: usize = 33;
const OUTPUT_WEIGHT: usize = 700; // commitment + range proof
const KERNEL_WEIGHT: usize = 113;

/// A spent output reference (Pedersen commitment, opaque here).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(with = "crate::serde_array33")]
    pub commitment: [u8; 33],
}

/// A new confidential output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(with = "crate::serde_array33")]
    pub commitment: [u8; 33],
    /// Set on node-synthesized dummy outputs: the height at which the node
    /// schedules the dummy to be spent again.
    pub dummy_spend_height: Option<Height>,
}

impl TxOutput {
    pub fn new(commitment: [u8; 33]) -> Self {
        Self {
            commitment,
            dummy_spend_height: None,
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy_spend_height.is_some()
    }
}

/// A transaction kernel: the fee-carrying, height-bounded signature element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxKernel {
    pub id: [u8; 32],
    pub fee: u64,
    pub height_range: HeightRange,
}

/// A confidential transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub kernels: Vec<TxKernel>,
}

impl Transaction {
    /// Deduplication key: digest of the sorted kernel ids. Stable across
    /// cut-through and input/output reordering.
    pub fn fingerprint(&self) -> TxFingerprint {
        let mut ids: Vec<[u8; 32]> = self.kernels.iter().map(|k| k.id).collect();
        ids.sort_unstable();
        let mut hasher = Sha256::new();
        for id in &ids {
            hasher.update(id);
        }
        TxFingerprint::new(hasher.finalize().into())
    }

    /// Total fee over all kernels.
    pub fn fee(&self) -> u64 {
        self.kernels.iter().map(|k| k.fee).sum()
    }

    /// Height interval in which every kernel is valid; empty if the kernels
    /// disagree irreconcilably.
    pub fn height_range(&self) -> HeightRange {
        self.kernels
            .iter()
            .fold(HeightRange::OPEN, |acc, k| acc.intersect(&k.height_range))
    }

    /// Estimated serialized size in bytes, used for pool byte caps and
    /// fee-rate ordering.
    pub fn weight(&self) -> usize {
        self.inputs.len() * INPUT_WEIGHT
            + self.outputs.len() * OUTPUT_WEIGHT
            + self.kernels.len() * KERNEL_WEIGHT
    }

    /// Fee per 1000 weight units. Zero-weight transactions rate zero.
    pub fn fee_rate(&self) -> u64 {
        let w = self.weight() as u64;
        if w == 0 {
            0
        } else {
            self.fee().saturating_mul(1000) / w
        }
    }

    /// Aggregate `other` into `self` (dandelion stem merging). The result
    /// is only meaningful when the height ranges intersect; the caller
    /// checks that before merging.
    pub fn merge(&mut self, other: Transaction) {
        self.inputs.extend(other.inputs);
        self.outputs.extend(other.outputs);
        self.kernels.extend(other.kernels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn tx_with_kernel(id_byte: u8, fee: u64) -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                commitment: [id_byte; 33],
            }],
            outputs: vec![TxOutput::new([id_byte.wrapping_add(1); 33])],
            kernels: vec![TxKernel {
                id: [id_byte; 32],
                fee,
                height_range: HeightRange::OPEN,
            }],
        }
    }

    #[test]
    fn fingerprint_ignores_kernel_order() {
        let mut a = tx_with_kernel(1, 10);
        a.merge(tx_with_kernel(2, 20));

        let mut b = tx_with_kernel(2, 20);
        b.merge(tx_with_kernel(1, 10));

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fee_and_weight_accumulate_on_merge() {
        let mut a = tx_with_kernel(1, 10);
        let w1 = a.weight();
        a.merge(tx_with_kernel(2, 20));
        assert_eq!(a.fee(), 30);
        assert_eq!(a.weight(), w1 * 2);
    }

    #[test]
    fn height_range_is_kernel_intersection() {
        let mut tx = tx_with_kernel(1, 1);
        tx.kernels[0].height_range = HeightRange::new(10, 100);
        tx.merge({
            let mut t = tx_with_kernel(2, 1);
            t.kernels[0].height_range = HeightRange::new(50, 200);
            t
        });
        assert_eq!(tx.height_range(), HeightRange::new(50, 100));
    }

    #[test]
    fn fee_rate_scales_with_weight() {
        let small = tx_with_kernel(1, 1000);
        let mut big = tx_with_kernel(1, 1000);
        big.outputs.push(TxOutput::new([9; 33]));
        assert!(small.fee_rate() > big.fee_rate());
    }
}
