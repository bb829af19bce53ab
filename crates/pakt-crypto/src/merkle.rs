//! Binary Merkle tree over 32-byte digests.
//!
//! Used for the per-token chain-of-custody root (over ownership-record
//! hashes) and for package roots (over token-id hashes). Odd nodes are
//! promoted unchanged to the next level, so a single-leaf tree has that
//! leaf as its root and an empty tree has the zero root.

use pakt_core::types::Digest;
use serde::{Deserialize, Serialize};

/// Interior-node domain prefix. Leaves arrive pre-hashed.
const NODE_PREFIX: u8 = 0x01;

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut buf = [0u8; 65];
    buf[0] = NODE_PREFIX;
    buf[1..33].copy_from_slice(left.as_bytes());
    buf[33..65].copy_from_slice(right.as_bytes());
    crate::hash::digest(&buf)
}

/// Compute the Merkle root of an ordered leaf sequence.
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return Digest::ZERO;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [l, r] => next.push(hash_pair(l, r)),
                [odd] => next.push(*odd),
                _ => unreachable!("chunks(2) yields 1 or 2 elements"),
            }
        }
        level = next;
    }
    level[0]
}

/// One step of an inclusion proof: the sibling digest and which side the
/// accumulated hash sits on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Digest,
    /// True when the accumulated hash is the left input at this step.
    pub accumulated_on_left: bool,
}

/// Inclusion proof for a single leaf.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the root from `leaf` along this path.
    pub fn root_from(&self, leaf: &Digest) -> Digest {
        let mut acc = *leaf;
        for step in &self.path {
            acc = if step.accumulated_on_left {
                hash_pair(&acc, &step.sibling)
            } else {
                hash_pair(&step.sibling, &acc)
            };
        }
        acc
    }

    /// True when `leaf` is included under `root` via this path.
    pub fn verify(&self, leaf: &Digest, root: &Digest) -> bool {
        self.root_from(leaf) == *root
    }
}

/// Build the inclusion proof for `leaf_index`. Returns `None` when the
/// index is out of range.
pub fn merkle_proof(leaves: &[Digest], leaf_index: usize) -> Option<MerkleProof> {
    if leaf_index >= leaves.len() {
        return None;
    }
    let mut path = Vec::new();
    let mut level = leaves.to_vec();
    let mut idx = leaf_index;
    while level.len() > 1 {
        let sibling_idx = idx ^ 1;
        if sibling_idx < level.len() {
            path.push(ProofStep {
                sibling: level[sibling_idx],
                accumulated_on_left: idx % 2 == 0,
            });
        }
        // Odd tail nodes are promoted without a step.
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [l, r] => next.push(hash_pair(l, r)),
                [odd] => next.push(*odd),
                _ => unreachable!("chunks(2) yields 1 or 2 elements"),
            }
        }
        level = next;
        idx /= 2;
    }
    Some(MerkleProof {
        leaf_index,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n).map(|i| digest(&[i as u8])).collect()
    }

    #[test]
    fn empty_tree_has_zero_root() {
        assert_eq!(merkle_root(&[]), Digest::ZERO);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l), l[0]);
    }

    #[test]
    fn root_changes_with_any_leaf() {
        let a = leaves(4);
        let mut b = a.clone();
        b[2] = digest(b"tampered");
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn root_depends_on_order() {
        let a = leaves(3);
        let mut b = a.clone();
        b.swap(0, 1);
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn proofs_verify_for_every_leaf_and_size() {
        for n in 1..=9 {
            let l = leaves(n);
            let root = merkle_root(&l);
            for (i, leaf) in l.iter().enumerate() {
                let proof = merkle_proof(&l, i).unwrap();
                assert!(proof.verify(leaf, &root), "size {n}, leaf {i}");
            }
        }
    }

    #[test]
    fn proof_fails_for_wrong_leaf() {
        let l = leaves(5);
        let root = merkle_root(&l);
        let proof = merkle_proof(&l, 2).unwrap();
        assert!(!proof.verify(&l[3], &root));
        assert!(!proof.verify(&digest(b"other"), &root));
    }

    #[test]
    fn out_of_range_proof_is_none() {
        assert!(merkle_proof(&leaves(3), 3).is_none());
    }
}
