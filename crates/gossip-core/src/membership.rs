//! Membership client: seed registration, peer-list union and peer selection.
//!
//! A joining peer:
//! 1. Registers with seeds (in random order) until ⌊n/2⌋+1 have accepted it
//! 2. Merges every returned snapshot into one set (excluding itself)
//! 3. Samples up to `fan_out` peers uniformly without replacement
//!
//! Uniform sampling approximates a power-law fan-out; it is the baseline
//! selection policy.

use crate::address::PeerAddress;
use crate::transport::SeedDirectory;
use futures::future::join_all;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Insufficient seeds: reached {reachable} of {required} required (of {total} configured)")]
    InsufficientSeeds {
        reachable: usize,
        required: usize,
        total: usize,
    },
}

/// Configuration for joining the network.
#[derive(Debug, Clone, Default)]
pub struct MembershipConfig {
    /// Maximum number of peers to connect to (`None` = all known peers)
    pub fan_out: Option<usize>,
}

/// A seed registration that failed during join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFailure {
    pub seed: PeerAddress,
    pub reason: String,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Seeds that accepted our registration, in attempt order
    pub registered: Vec<PeerAddress>,
    /// Seeds that could not be reached
    pub failures: Vec<RegistrationFailure>,
    /// Union of all returned peer lists, without ourselves
    pub known: BTreeSet<PeerAddress>,
    /// Peers chosen for connection
    pub selected: Vec<PeerAddress>,
}

/// Minimum number of seeds a peer must register with: ⌊n/2⌋+1.
pub fn quorum_size(seed_count: usize) -> usize {
    seed_count / 2 + 1
}

/// Union of several peer-list snapshots, excluding `own`.
pub fn merge_peer_lists<I, L>(lists: I, own: &PeerAddress) -> BTreeSet<PeerAddress>
where
    I: IntoIterator<Item = L>,
    L: IntoIterator<Item = PeerAddress>,
{
    lists
        .into_iter()
        .flatten()
        .filter(|addr| addr != own)
        .collect()
}

/// Uniformly sample up to `fan_out` peers without replacement.
pub fn select_peers<R: Rng + ?Sized>(
    candidates: &BTreeSet<PeerAddress>,
    fan_out: Option<usize>,
    rng: &mut R,
) -> Vec<PeerAddress> {
    let pool: Vec<PeerAddress> = candidates.iter().cloned().collect();
    let count = fan_out.unwrap_or(pool.len()).min(pool.len());
    pool.choose_multiple(rng, count).cloned().collect()
}

/// Join the network through `seeds`.
///
/// Fails with [`MembershipError::InsufficientSeeds`] when fewer than a quorum
/// of seeds accept the registration. Individual failures are logged and
/// skipped as long as the quorum can still be met by the remaining seeds.
pub async fn join<D, R>(
    directory: &D,
    seeds: &[PeerAddress],
    own: &PeerAddress,
    config: &MembershipConfig,
    rng: &mut R,
) -> Result<JoinOutcome, MembershipError>
where
    D: SeedDirectory + ?Sized,
    R: Rng + ?Sized,
{
    let required = quorum_size(seeds.len());
    let mut order: Vec<PeerAddress> = seeds.to_vec();
    order.shuffle(rng);

    let mut registered = Vec::new();
    let mut failures = Vec::new();
    let mut snapshots = Vec::new();

    for seed in order {
        if registered.len() >= required {
            break;
        }
        match directory.register(&seed, own).await {
            Ok(peers) => {
                debug!("Registered with seed {} ({} peer(s) known)", seed, peers.len());
                snapshots.push(peers);
                registered.push(seed);
            }
            Err(e) => {
                warn!("Registration with seed {} failed: {}", seed, e);
                failures.push(RegistrationFailure {
                    seed,
                    reason: e.to_string(),
                });
            }
        }
    }

    if registered.len() < required {
        return Err(MembershipError::InsufficientSeeds {
            reachable: registered.len(),
            required,
            total: seeds.len(),
        });
    }

    let known = merge_peer_lists(snapshots, own);
    let selected = select_peers(&known, config.fan_out, rng);
    info!(
        "Joined via {}/{} seed(s): {} known peer(s), {} selected",
        registered.len(),
        seeds.len(),
        known.len(),
        selected.len()
    );

    Ok(JoinOutcome {
        registered,
        failures,
        known,
        selected,
    })
}

/// Send a dead-node report to every seed concurrently.
///
/// Returns the number of seeds the report was delivered to.
pub async fn report_dead_to_all<D>(
    directory: &D,
    seeds: &[PeerAddress],
    dead: &PeerAddress,
    reporter: &PeerAddress,
) -> usize
where
    D: SeedDirectory + ?Sized,
{
    let results = join_all(
        seeds
            .iter()
            .map(|seed| async move { (seed, directory.report_dead(seed, dead, reporter).await) }),
    )
    .await;

    let mut delivered = 0;
    for (seed, result) in results {
        match result {
            Ok(()) => delivered += 1,
            Err(e) => warn!("Failed to report dead node {} to seed {}: {}", dead, seed, e),
        }
    }
    delivered
}
