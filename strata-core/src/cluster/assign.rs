//! One pass of the role-assignment algorithm.
//!
//! The pass is a pure function over the current membership and the
//! previous assignment, which keeps it deterministic and testable. The
//! controller loop feeds it discovery snapshots and publishes its output.

use std::collections::{BTreeMap, BTreeSet};

use super::{Addresses, ServerRole, ServerState, ShardAddresses};

pub(crate) struct AssignmentPass {
    pub roles: BTreeMap<String, ServerRole>,
    pub masters: BTreeMap<u64, String>,
    pub replicas: BTreeMap<u64, Vec<String>>,
    pub addresses: Addresses,
}

/// Compute a sticky, balanced assignment of every shard's master and
/// replicas across `states`.
///
/// Candidates are tried in preference order: the shard's previous master,
/// any previous replica, any server already holding the shard locally,
/// then any server at all. A candidate is charged against a per-server
/// capacity of `⌊N/K⌋` plus a shared remainder, so every server ends up
/// with `⌊N/K⌋` or `⌈N/K⌉` of each role. Returns `None` when no
/// assignment satisfies the capacities.
pub(crate) fn plan_assignment(
    num_shards: u64,
    num_replicas: u64,
    version: i64,
    states: &BTreeMap<String, ServerState>,
    old_masters: &BTreeMap<u64, String>,
    old_replicas: &BTreeMap<u64, Vec<String>>,
) -> Option<AssignmentPass> {
    if states.is_empty() {
        return None;
    }
    let server_count = states.len() as u64;
    let masters_per_server = num_shards / server_count;
    let mut masters_remainder = num_shards % server_count;
    let replicas_per_server = (num_shards * num_replicas) / server_count;
    let mut replicas_remainder = (num_shards * num_replicas) % server_count;

    let mut shard_locations: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    let mut roles: BTreeMap<String, ServerRole> = BTreeMap::new();
    for (address, state) in states {
        roles.insert(
            address.clone(),
            ServerRole {
                address: address.clone(),
                version,
                masters: BTreeSet::new(),
                replicas: BTreeSet::new(),
            },
        );
        for &shard in &state.shards {
            shard_locations
                .entry(shard)
                .or_default()
                .push(address.clone());
        }
    }

    let mut masters: BTreeMap<u64, String> = BTreeMap::new();
    let mut replicas: BTreeMap<u64, Vec<String>> = BTreeMap::new();

    'master: for shard in 0..num_shards {
        for address in master_candidates(shard, old_masters, old_replicas, &shard_locations, states)
        {
            if assign_master(
                &mut roles,
                &mut masters,
                &address,
                shard,
                masters_per_server,
                &mut masters_remainder,
            ) {
                continue 'master;
            }
        }
        return None;
    }

    for _ in 0..num_replicas {
        'replica: for shard in 0..num_shards {
            for address in
                master_candidates(shard, old_masters, old_replicas, &shard_locations, states)
            {
                if assign_replica(
                    &mut roles,
                    &mut replicas,
                    &address,
                    shard,
                    replicas_per_server,
                    &mut replicas_remainder,
                ) {
                    continue 'replica;
                }
            }
            for address in states.keys() {
                if swap_replica(
                    &mut roles,
                    &mut replicas,
                    address,
                    shard,
                    replicas_per_server,
                ) {
                    continue 'replica;
                }
            }
            return None;
        }
    }

    let mut addresses = Addresses {
        version,
        addresses: BTreeMap::new(),
    };
    for shard in 0..num_shards {
        addresses.addresses.insert(
            shard,
            ShardAddresses {
                master: String::new(),
                replicas: BTreeSet::new(),
            },
        );
    }
    for role in roles.values() {
        for &shard in &role.masters {
            if let Some(entry) = addresses.addresses.get_mut(&shard) {
                entry.master = role.address.clone();
            }
        }
        for &shard in &role.replicas {
            if let Some(entry) = addresses.addresses.get_mut(&shard) {
                entry.replicas.insert(role.address.clone());
            }
        }
    }

    Some(AssignmentPass {
        roles,
        masters,
        replicas,
        addresses,
    })
}

/// Candidate addresses in preference order; duplicates are harmless since
/// a server that already holds the shard is rejected by the assigners.
fn master_candidates(
    shard: u64,
    old_masters: &BTreeMap<u64, String>,
    old_replicas: &BTreeMap<u64, Vec<String>>,
    shard_locations: &BTreeMap<u64, Vec<String>>,
    states: &BTreeMap<String, ServerState>,
) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(address) = old_masters.get(&shard) {
        candidates.push(address.clone());
    }
    if let Some(addresses) = old_replicas.get(&shard) {
        candidates.extend(addresses.iter().cloned());
    }
    if let Some(addresses) = shard_locations.get(&shard) {
        candidates.extend(addresses.iter().cloned());
    }
    candidates.extend(states.keys().cloned());
    candidates
}

fn has_shard(role: &ServerRole, shard: u64) -> bool {
    role.masters.contains(&shard) || role.replicas.contains(&shard)
}

fn assign_master(
    roles: &mut BTreeMap<String, ServerRole>,
    masters: &mut BTreeMap<u64, String>,
    address: &str,
    shard: u64,
    masters_per_server: u64,
    masters_remainder: &mut u64,
) -> bool {
    let Some(role) = roles.get_mut(address) else {
        return false;
    };
    let count = role.masters.len() as u64;
    if count > masters_per_server {
        return false;
    }
    if count == masters_per_server && *masters_remainder == 0 {
        return false;
    }
    if has_shard(role, shard) {
        return false;
    }
    if count == masters_per_server {
        *masters_remainder -= 1;
    }
    role.masters.insert(shard);
    masters.insert(shard, address.to_string());
    true
}

fn assign_replica(
    roles: &mut BTreeMap<String, ServerRole>,
    replicas: &mut BTreeMap<u64, Vec<String>>,
    address: &str,
    shard: u64,
    replicas_per_server: u64,
    replicas_remainder: &mut u64,
) -> bool {
    let Some(role) = roles.get_mut(address) else {
        return false;
    };
    let count = role.replicas.len() as u64;
    if count > replicas_per_server {
        return false;
    }
    if count == replicas_per_server && *replicas_remainder == 0 {
        return false;
    }
    if has_shard(role, shard) {
        return false;
    }
    if count == replicas_per_server {
        *replicas_remainder -= 1;
    }
    role.replicas.insert(shard);
    replicas.entry(shard).or_default().push(address.to_string());
    true
}

fn remove_replica(replicas: &mut BTreeMap<u64, Vec<String>>, shard: u64, address: &str) {
    if let Some(addresses) = replicas.get_mut(&shard) {
        addresses.retain(|other| other != address);
    }
}

/// Last resort for a replica slot nobody can take directly: find another
/// server whose existing replica assignment would be legal here, trade
/// shards with it, and fill both slots. The trade is constrained so that
/// neither server ends up holding master and replica of the same shard.
fn swap_replica(
    roles: &mut BTreeMap<String, ServerRole>,
    replicas: &mut BTreeMap<u64, Vec<String>>,
    address: &str,
    shard: u64,
    replicas_per_server: u64,
) -> bool {
    let Some(role) = roles.get(address) else {
        return false;
    };
    if role.replicas.len() as u64 >= replicas_per_server {
        return false;
    }
    let mut found: Option<(String, u64)> = None;
    'search: for (swap_address, swap_role) in roles.iter() {
        if swap_address == address || has_shard(swap_role, shard) {
            continue;
        }
        for &swap_shard in &swap_role.replicas {
            if has_shard(&roles[address], swap_shard) {
                continue;
            }
            found = Some((swap_address.clone(), swap_shard));
            break 'search;
        }
    }
    let Some((swap_address, swap_shard)) = found else {
        return false;
    };
    if let Some(swap_role) = roles.get_mut(&swap_address) {
        swap_role.replicas.remove(&swap_shard);
    }
    remove_replica(replicas, swap_shard, &swap_address);
    // the swap partner replaces a shard it gave up, so it gets unbounded
    // capacity; `address` was already checked to be under its limit
    let mut no_remainder = 0u64;
    assign_replica(roles, replicas, &swap_address, shard, u64::MAX, &mut no_remainder);
    assign_replica(
        roles,
        replicas,
        address,
        swap_shard,
        replicas_per_server,
        &mut no_remainder,
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(addresses: &[&str]) -> BTreeMap<String, ServerState> {
        addresses
            .iter()
            .map(|address| {
                (
                    address.to_string(),
                    ServerState {
                        address: address.to_string(),
                        version: -1,
                        shards: BTreeSet::new(),
                    },
                )
            })
            .collect()
    }

    fn check_invariants(pass: &AssignmentPass, num_shards: u64, num_replicas: u64) {
        let server_count = pass.roles.len() as u64;
        let floor_masters = num_shards / server_count;
        let floor_replicas = (num_shards * num_replicas) / server_count;

        let mut seen_masters: BTreeSet<u64> = BTreeSet::new();
        for role in pass.roles.values() {
            let masters = role.masters.len() as u64;
            assert!(
                masters == floor_masters || masters == floor_masters + 1,
                "unbalanced masters for {}: {}",
                role.address,
                masters
            );
            let replicas = role.replicas.len() as u64;
            assert!(
                replicas == floor_replicas || replicas == floor_replicas + 1,
                "unbalanced replicas for {}: {}",
                role.address,
                replicas
            );
            assert!(
                role.masters.is_disjoint(&role.replicas),
                "{} is master and replica of the same shard",
                role.address
            );
            for &shard in &role.masters {
                assert!(seen_masters.insert(shard), "shard {} has two masters", shard);
            }
        }
        assert_eq!(seen_masters.len() as u64, num_shards);

        for shard in 0..num_shards {
            let entry = &pass.addresses.addresses[&shard];
            assert!(!entry.master.is_empty());
            assert_eq!(entry.replicas.len() as u64, num_replicas);
            assert!(!entry.replicas.contains(&entry.master));
        }
    }

    #[test]
    fn single_server_takes_everything() {
        let pass =
            plan_assignment(32, 0, 0, &states(&["s1:650"]), &BTreeMap::new(), &BTreeMap::new())
                .unwrap();
        check_invariants(&pass, 32, 0);
        assert_eq!(pass.roles["s1:650"].masters.len(), 32);
    }

    #[test]
    fn three_servers_one_replica_balance() {
        let members = states(&["s1:650", "s2:650", "s3:650"]);
        let pass =
            plan_assignment(32, 1, 0, &members, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        check_invariants(&pass, 32, 1);
        for role in pass.roles.values() {
            assert!(role.masters.len() == 10 || role.masters.len() == 11);
            assert!(role.replicas.len() == 10 || role.replicas.len() == 11);
        }
    }

    #[test]
    fn rebalance_after_leave_is_sticky() {
        let members = states(&["s1:650", "s2:650", "s3:650"]);
        let first =
            plan_assignment(32, 1, 0, &members, &BTreeMap::new(), &BTreeMap::new()).unwrap();

        let survivors = states(&["s1:650", "s2:650"]);
        let second =
            plan_assignment(32, 1, 1, &survivors, &first.masters, &first.replicas).unwrap();
        check_invariants(&second, 32, 1);

        for role in second.roles.values() {
            assert_eq!(role.masters.len(), 16);
        }
        // every shard a survivor mastered before stays with it if capacity
        // allows; at least one survivor keeps its whole old master set
        let sticky = ["s1:650", "s2:650"].iter().any(|address| {
            first.roles[*address]
                .masters
                .is_subset(&second.roles[*address].masters)
        });
        assert!(sticky, "no survivor kept its previous master set");
    }

    #[test]
    fn balance_across_server_counts() {
        for server_count in 1..=8u64 {
            let names: Vec<String> = (0..server_count).map(|i| format!("s{}:650", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let members = states(&refs);
            let replicas = if server_count > 1 { 1 } else { 0 };
            let pass =
                plan_assignment(32, replicas, 0, &members, &BTreeMap::new(), &BTreeMap::new())
                    .unwrap();
            check_invariants(&pass, 32, replicas);
        }
    }

    #[test]
    fn two_replicas_need_three_servers() {
        // with R replicas each shard needs R+1 distinct servers
        let members = states(&["s1:650", "s2:650"]);
        assert!(plan_assignment(32, 2, 0, &members, &BTreeMap::new(), &BTreeMap::new()).is_none());

        let members = states(&["s1:650", "s2:650", "s3:650"]);
        let pass =
            plan_assignment(32, 2, 0, &members, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        check_invariants(&pass, 32, 2);
    }

    #[test]
    fn join_promotes_existing_replicas_first() {
        let members = states(&["s1:650", "s2:650"]);
        let first =
            plan_assignment(32, 1, 0, &members, &BTreeMap::new(), &BTreeMap::new()).unwrap();

        let grown = states(&["s1:650", "s2:650", "s3:650"]);
        let second = plan_assignment(32, 1, 1, &grown, &first.masters, &first.replicas).unwrap();
        check_invariants(&second, 32, 1);

        // shards that moved off their old master went to their old replica
        // wherever capacity allowed
        let moved_to_replica = second
            .masters
            .iter()
            .filter(|(shard, address)| {
                first.masters.get(shard) != Some(address)
                    && first
                        .replicas
                        .get(shard)
                        .map(|old| old.contains(address))
                        .unwrap_or(false)
            })
            .count();
        assert!(moved_to_replica > 0);
    }
}
