//! Concurrent multi-peer data gathering.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use rand::seq::SliceRandom;
use rmpv::Value;
use tracing::{debug, warn};

use crate::address::Address;
use crate::comm::rpc::Rpc;
use crate::proto::{keys_value, Key, Msg};

/// Result of a gather run.
#[derive(Debug, Default)]
pub struct GatherOutcome {
    /// Key → fetched value.
    pub results: HashMap<Key, Value>,
    /// Keys that ran out of eligible peers.
    pub bad_keys: Vec<Key>,
    /// Peers whose calls failed; never retried within the run.
    pub missing_workers: Vec<Address>,
}

/// Fetch every key in `who_has` from the advertised peers.
///
/// Runs in rounds: each still-missing key picks one of its still-eligible
/// addresses uniformly at random, requests are grouped per address and fired
/// concurrently, and responses are merged. An address whose call fails is
/// dropped for the remainder of the run; a key whose advertised addresses are
/// exhausted becomes bad. Each round removes at least one address from some
/// key's eligible set, so the run terminates.
pub async fn gather_from_workers(
    rpc: &Rpc,
    who: &Address,
    who_has: &HashMap<Key, HashSet<Address>>,
) -> GatherOutcome {
    let mut outcome = GatherOutcome::default();
    let mut bad_addresses: HashSet<Address> = HashSet::new();
    // Peers that answered but did not hold the key, per key.
    let mut refused: HashMap<Key, HashSet<Address>> = HashMap::new();

    loop {
        let mut plan: HashMap<Address, Vec<Key>> = HashMap::new();
        {
            let mut rng = rand::thread_rng();
            for (key, addrs) in who_has {
                if outcome.results.contains_key(key) || outcome.bad_keys.contains(key) {
                    continue;
                }
                let ineligible = refused.entry(key.clone()).or_default();
                let eligible: Vec<&Address> = addrs
                    .iter()
                    .filter(|a| !bad_addresses.contains(*a) && !ineligible.contains(*a))
                    .collect();
                match eligible.choose(&mut rng) {
                    Some(addr) => plan.entry((*addr).clone()).or_default().push(key.clone()),
                    None => outcome.bad_keys.push(key.clone()),
                }
            }
        }
        if plan.is_empty() {
            break;
        }

        let calls = plan.into_iter().map(|(addr, keys)| {
            let rpc = rpc.clone();
            let who = who.to_string();
            async move {
                let msg = Msg::new("get_data")
                    .with("keys", keys_value(keys.iter()))
                    .with("who", who);
                let reply = rpc.call(&addr, msg).await;
                (addr, keys, reply)
            }
        });

        for (addr, keys, reply) in join_all(calls).await {
            match reply.ok().and_then(Msg::from_value) {
                Some(reply) => {
                    let mut returned: HashSet<Key> = HashSet::new();
                    for (k, v) in reply.fields() {
                        returned.insert(k.to_string());
                        outcome.results.insert(k.to_string(), v.clone());
                    }
                    debug!(addr = %addr, keys = returned.len(), "gather round succeeded");
                    for key in keys {
                        if !returned.contains(&key) {
                            refused.entry(key).or_default().insert(addr.clone());
                        }
                    }
                }
                None => {
                    warn!(addr = %addr, "peer failed during gather, dropping it");
                    bad_addresses.insert(addr);
                }
            }
        }
    }

    outcome.missing_workers = bad_addresses.into_iter().collect();
    outcome
}
