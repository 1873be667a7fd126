use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use crate::raft::{ClusterMember, ConsensusEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(ClusterMember),
    Remove { id: String, address: String },
}

/// Diffs current voters against the live set (`member id -> address`), keyed on address.
///
/// Voters whose address is not live are removed; live addresses with no voter are added.
/// Removals come first, then additions, each group in a stable order.
pub fn plan(voters: &[ClusterMember], live: &BTreeMap<String, String>) -> Vec<MembershipChange> {
    let live_addresses: BTreeSet<&str> = live.values().map(String::as_str).collect();
    let voter_addresses: BTreeSet<&str> = voters.iter().map(|v| v.address.as_str()).collect();

    let mut changes: Vec<MembershipChange> = voters
        .iter()
        .filter(|v| !live_addresses.contains(v.address.as_str()))
        .map(|v| MembershipChange::Remove {
            id: v.id.clone(),
            address: v.address.clone(),
        })
        .collect();

    changes.extend(
        live.iter()
            .filter(|(_, address)| !voter_addresses.contains(address.as_str()))
            .map(|(id, address)| MembershipChange::Add(ClusterMember::voter(id, address))),
    );
    changes
}

/// Executes `changes` one at a time, each bounded by `timeout`. Failures are logged and
/// skipped; nothing is retried until the next reconciliation. Returns the number applied.
pub async fn execute(
    engine: &dyn ConsensusEngine,
    changes: Vec<MembershipChange>,
    timeout: Duration,
) -> usize {
    let mut applied = 0;
    for change in changes {
        let result = match &change {
            MembershipChange::Add(member) => engine.add_voter(member.clone(), 0, timeout).await,
            MembershipChange::Remove { id, .. } => engine.remove_server(id.clone(), 0, timeout).await,
        };
        match result {
            Ok(()) => {
                tracing::info!(?change, "membership change applied");
                applied += 1;
            }
            Err(err) => tracing::warn!(?change, error = %err, "membership change failed"),
        }
    }
    applied
}
