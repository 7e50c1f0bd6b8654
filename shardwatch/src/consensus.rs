//! Vote aggregation across independent observers.
//!
//! Several observers watch the same members and each publishes a
//! [`Snapshot`] of what it currently sees. The functions here fold those
//! snapshots into a single decision. They are pure and keep no state, so they
//! can be called from anywhere.
//!
//! Two rules exist and they deliberately disagree on silence:
//!
//! | Rule | Observer mentions member as available | ...as unavailable | ...not at all |
//! |---|---|---|---|
//! | [`aggregate`] | +1 | −1 | no vote |
//! | [`is_available`] | +1 | −1 | +1 |
//!
//! In both rules a tally of zero means unavailable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One observer's view of member availability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Members this observer can reach.
    #[serde(default)]
    pub available: Vec<String>,

    /// Members this observer cannot reach.
    #[serde(default)]
    pub unavailable: Vec<String>,
}

impl Snapshot {
    /// Create a snapshot from available and unavailable member lists.
    pub fn new<A, U>(available: A, unavailable: U) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        U: IntoIterator,
        U::Item: Into<String>,
    {
        Self {
            available: available.into_iter().map(Into::into).collect(),
            unavailable: unavailable.into_iter().map(Into::into).collect(),
        }
    }
}

/// Result of [`aggregate`]: every member mentioned by at least one observer,
/// split by verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Members with a positive tally.
    pub available: Vec<String>,
    /// Members with a tally of zero or less.
    pub unavailable: Vec<String>,
}

/// Fold observer snapshots into one partition using a signed sum.
///
/// Each appearance in an `available` list adds one vote, each appearance in
/// an `unavailable` list removes one. Members nobody mentions are absent from
/// the result. Ties go to `unavailable`. Within each side, members keep the
/// order in which they were first mentioned.
pub fn aggregate(snapshots: &[Snapshot]) -> Partition {
    let mut order: Vec<&str> = Vec::new();
    let mut votes: HashMap<&str, i64> = HashMap::new();

    for snapshot in snapshots {
        for member in &snapshot.available {
            let entry = votes.entry(member.as_str()).or_insert_with(|| {
                order.push(member.as_str());
                0
            });
            *entry += 1;
        }
        for member in &snapshot.unavailable {
            let entry = votes.entry(member.as_str()).or_insert_with(|| {
                order.push(member.as_str());
                0
            });
            *entry -= 1;
        }
    }

    let mut partition = Partition::default();
    for member in order {
        if votes.get(member).copied().unwrap_or_default() > 0 {
            partition.available.push(member.to_string());
        } else {
            partition.unavailable.push(member.to_string());
        }
    }
    partition
}

/// Decide whether a single member is available.
///
/// Every snapshot votes: −1 if it lists `member` as unavailable, +1
/// otherwise, including when it does not mention `member` at all. The member
/// is available when the tally is positive, so an empty snapshot list yields
/// `false`.
pub fn is_available(member: &str, snapshots: &[Snapshot]) -> bool {
    let tally: i64 = snapshots
        .iter()
        .map(|snapshot| {
            if snapshot.unavailable.iter().any(|m| m == member) {
                -1
            } else {
                1
            }
        })
        .sum();
    tally > 0
}
