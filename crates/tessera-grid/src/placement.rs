//! Share-to-peer assignment
//!
//! Shares go to peers in permutation order, one per peer while fresh peers
//! last. A refusal retires that peer and sends the share on to the next
//! candidate. Once no fresh peer is left, a share may go to a peer that has
//! already accepted one (fewest held first), but never twice to the same
//! peer. Every request is in flight at once; the caller decides success
//! from the returned [`Placement`].

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tessera_core::{GridError, PeerId, ShareNum};
use tessera_storage::StorageNode;
use tracing::{debug, warn};

/// How one peer answered one placement request.
#[derive(Debug)]
pub enum PlaceResponse {
    Accepted,
    /// Full, offline, reclaiming, or otherwise unwilling
    Refused(GridError),
    /// The peer holds `current` >= the offered version; no retry elsewhere
    Stale { current: u64 },
}

#[derive(Debug, Default)]
pub struct Placement {
    /// (share, index into the peer list) for every accepted share
    pub holders: Vec<(ShareNum, usize)>,
    pub unplaced: Vec<ShareNum>,
    /// Versions reported by peers that turned the write down as stale
    pub stale: Vec<u64>,
    pub refusals: usize,
}

impl Placement {
    pub fn distinct_shares(&self) -> usize {
        self.holders.iter().map(|(s, _)| *s).collect::<BTreeSet<_>>().len()
    }

    pub fn holder_ids(&self, peers: &[Arc<dyn StorageNode>]) -> Vec<(ShareNum, PeerId)> {
        self.holders
            .iter()
            .map(|(s, p)| (*s, peers[*p].peer_id()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Fresh,
    /// First request outstanding
    Probing,
    /// Has accepted at least one share
    Accepting,
    Retired,
}

struct Assigner {
    states: Vec<PeerState>,
    /// Requests assigned to each peer, in flight or accepted
    load: Vec<usize>,
    tried: Vec<HashSet<usize>>,
}

impl Assigner {
    fn new(peers: usize, shares: usize) -> Self {
        Self {
            states: vec![PeerState::Fresh; peers],
            load: vec![0; peers],
            tried: vec![HashSet::new(); shares],
        }
    }

    /// Next peer for the share at `slot`, or `None` if nobody is left who
    /// might take it right now. Reuse waits until every first request has
    /// been answered, so reused peers are picked by settled load.
    fn next_for(&mut self, slot: usize) -> Option<usize> {
        let tried = &self.tried[slot];
        let fresh = self
            .states
            .iter()
            .enumerate()
            .find(|(i, s)| **s == PeerState::Fresh && !tried.contains(i))
            .map(|(i, _)| i);
        let pick = match fresh {
            Some(i) => i,
            None if self.states.contains(&PeerState::Probing) => return None,
            None => self
                .states
                .iter()
                .enumerate()
                .filter(|(i, s)| **s == PeerState::Accepting && !tried.contains(i))
                .map(|(i, _)| (self.load[i], i))
                .min()
                .map(|(_, i)| i)?,
        };
        if self.states[pick] == PeerState::Fresh {
            self.states[pick] = PeerState::Probing;
        }
        self.load[pick] += 1;
        self.tried[slot].insert(pick);
        Some(pick)
    }

    fn settle(&mut self, peer: usize, response: &PlaceResponse) {
        match response {
            PlaceResponse::Accepted => self.states[peer] = PeerState::Accepting,
            PlaceResponse::Refused(_) | PlaceResponse::Stale { .. } => {
                self.states[peer] = PeerState::Retired;
                self.load[peer] = self.load[peer].saturating_sub(1);
            }
        }
    }
}

type Tagged = BoxFuture<'static, (usize, usize, PlaceResponse)>;

fn tag(slot: usize, peer: usize, request: BoxFuture<'static, PlaceResponse>) -> Tagged {
    async move { (slot, peer, request.await) }.boxed()
}

/// Place `shares` on `peers` (already in permutation order) using `send` to
/// issue one request.
pub async fn place_shares<F>(
    peers: &[Arc<dyn StorageNode>],
    shares: &[ShareNum],
    send: F,
) -> Placement
where
    F: Fn(Arc<dyn StorageNode>, ShareNum) -> BoxFuture<'static, PlaceResponse>,
{
    let mut assigner = Assigner::new(peers.len(), shares.len());
    let mut placement = Placement::default();
    let mut waiting: VecDeque<usize> = VecDeque::new();
    let mut in_flight: FuturesUnordered<Tagged> = FuturesUnordered::new();

    for slot in 0..shares.len() {
        match assigner.next_for(slot) {
            Some(peer) => in_flight.push(tag(slot, peer, send(peers[peer].clone(), shares[slot]))),
            None => waiting.push_back(slot),
        }
    }

    while let Some((slot, peer, response)) = in_flight.next().await {
        let share = shares[slot];
        assigner.settle(peer, &response);
        match response {
            PlaceResponse::Accepted => {
                placement.holders.push((share, peer));
                debug!(share, peer = %peers[peer].peer_id().short(), "share placed");
            }
            PlaceResponse::Refused(err) => {
                placement.refusals += 1;
                warn!(share, peer = %peers[peer].peer_id().short(), "placement refused: {err}");
                waiting.push_front(slot);
            }
            PlaceResponse::Stale { current } => {
                placement.stale.push(current);
                placement.unplaced.push(share);
                debug!(share, current, peer = %peers[peer].peer_id().short(), "peer holds a newer version");
            }
        }

        // A settled peer may now be reusable; hand out waiting shares.
        let mut still_waiting = VecDeque::new();
        while let Some(slot) = waiting.pop_front() {
            match assigner.next_for(slot) {
                Some(peer) => in_flight.push(tag(slot, peer, send(peers[peer].clone(), shares[slot]))),
                None => still_waiting.push_back(slot),
            }
        }
        waiting = still_waiting;
    }

    placement
        .unplaced
        .extend(waiting.into_iter().map(|slot| shares[slot]));
    placement
}
