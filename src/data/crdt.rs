//! Convergent replicated datatypes carried as gossip payloads.
//!
//! Every variant's `merge` is commutative, associative and idempotent, so
//! replicas that observed the same multiset of updates converge regardless
//! of delivery order or duplication.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Tagged CRDT payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CrdtValue {
    /// Grow-only set; merge is set union.
    GrowOnlySet(BTreeSet<String>),
    /// Grow-only counter keyed per node; merge is pointwise max and the
    /// logical value is the sum of components.
    GrowOnlyCounter(BTreeMap<String, u64>),
    /// Increment/decrement counter built from two grow-only maps.
    PnCounter {
        increments: BTreeMap<String, u64>,
        decrements: BTreeMap<String, u64>,
    },
    /// Ballot used by the shared-data lock: node id -> affirmative vote.
    /// Merge keeps every vote seen; a vote never flips back to false.
    MajorityVote(BTreeMap<String, bool>),
}

impl CrdtValue {
    /// Lattice join of two values. Mismatched variants cannot be joined;
    /// the local value is kept and the remote one dropped with a warning.
    pub fn merge(&self, other: &CrdtValue) -> CrdtValue {
        match (self, other) {
            (CrdtValue::GrowOnlySet(a), CrdtValue::GrowOnlySet(b)) => {
                CrdtValue::GrowOnlySet(a.union(b).cloned().collect())
            }
            (CrdtValue::GrowOnlyCounter(a), CrdtValue::GrowOnlyCounter(b)) => {
                CrdtValue::GrowOnlyCounter(merge_max(a, b))
            }
            (
                CrdtValue::PnCounter {
                    increments: ap,
                    decrements: an,
                },
                CrdtValue::PnCounter {
                    increments: bp,
                    decrements: bn,
                },
            ) => CrdtValue::PnCounter {
                increments: merge_max(ap, bp),
                decrements: merge_max(an, bn),
            },
            (CrdtValue::MajorityVote(a), CrdtValue::MajorityVote(b)) => {
                let mut out = a.clone();
                for (node, &vote) in b {
                    out.entry(node.clone())
                        .and_modify(|v| *v = *v || vote)
                        .or_insert(vote);
                }
                CrdtValue::MajorityVote(out)
            }
            (kept, dropped) => {
                tracing::warn!(
                    "Refusing to merge mismatched CRDT variants ({} vs {}); keeping current",
                    kept.variant_name(),
                    dropped.variant_name()
                );
                kept.clone()
            }
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            CrdtValue::GrowOnlySet(_) => "grow-only-set",
            CrdtValue::GrowOnlyCounter(_) => "grow-only-counter",
            CrdtValue::PnCounter { .. } => "pn-counter",
            CrdtValue::MajorityVote(_) => "majority-vote",
        }
    }

    /// Logical value of a counter variant; `None` for sets and ballots.
    pub fn counter_value(&self) -> Option<i64> {
        match self {
            CrdtValue::GrowOnlyCounter(counts) => {
                Some(counts.values().map(|&v| v as i64).sum())
            }
            CrdtValue::PnCounter {
                increments,
                decrements,
            } => {
                let p: i64 = increments.values().map(|&v| v as i64).sum();
                let n: i64 = decrements.values().map(|&v| v as i64).sum();
                Some(p - n)
            }
            _ => None,
        }
    }
}

fn merge_max(a: &BTreeMap<String, u64>, b: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    let mut out = a.clone();
    for (node, &count) in b {
        out.entry(node.clone())
            .and_modify(|c| *c = (*c).max(count))
            .or_insert(count);
    }
    out
}
