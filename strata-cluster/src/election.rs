//! Controller election.
//!
//! Once the mesh is complete (every other node connected) each node
//! broadcasts a vote for a candidate and tallies the votes it receives.
//! A candidate holding a majority of the expected cluster size wins. If
//! a round collects every vote without a majority, all nodes switch to
//! the best candidate seen and retry on the next round, which converges
//! because ties always break toward the highest node ID.
//!
//! A node that already converged answers later votes with a `force`
//! reply carrying the settled controller, so a restarted node adopts
//! the incumbent instead of forcing a re-election.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use strata_net::{Connection, Packet, PacketType};

use crate::messages::{ControllerVote, PeerAware};
use crate::peer::PeerManager;

/// Poll interval while waiting for votes in a round.
const VOTE_WAIT_MS: u64 = 10;

#[derive(Debug, Default)]
struct ElectionState {
    current_vote: Option<ControllerVote>,
    round: u32,
    votes: Vec<ControllerVote>,
    converged: bool,
    /// Set when convergence came from a forced reply rather than a tally.
    forced: bool,
    /// Replies-to-late-voters credit, earned from peer announcements.
    reannounce_budget: u32,
}

pub struct ControllerElection {
    node_id: u32,
    peers: Arc<PeerManager>,
    num_of_node: AtomicU32,
    state: Mutex<ElectionState>,
    vote_notify: Notify,
    election_running: AtomicBool,
    controller: watch::Sender<Option<u32>>,
}

/// Returns the vote that settles the tally, if any. A forced vote wins
/// outright; otherwise a candidate needs `quorum` votes.
pub(crate) fn winning_vote(votes: &[ControllerVote], quorum: u32) -> Option<ControllerVote> {
    if let Some(forced) = votes.iter().find(|vote| vote.force) {
        return Some(forced.clone());
    }
    for vote in votes {
        let count = votes
            .iter()
            .filter(|other| other.controller_id == vote.controller_id)
            .count() as u32;
        if count >= quorum {
            return Some(vote.clone());
        }
    }
    None
}

/// Candidate to carry into the next round after a split: the highest
/// node ID seen in this round's votes.
pub(crate) fn better_candidate(votes: &[ControllerVote]) -> u32 {
    votes
        .iter()
        .map(|vote| vote.controller_id)
        .max()
        .unwrap_or(0)
}

impl ControllerElection {
    pub fn new(node_id: u32, num_of_node: u32, peers: Arc<PeerManager>) -> Arc<Self> {
        let (controller, _) = watch::channel(None);
        Arc::new(Self {
            node_id,
            peers,
            num_of_node: AtomicU32::new(num_of_node),
            state: Mutex::new(ElectionState {
                current_vote: Some(ControllerVote {
                    voter_id: node_id,
                    controller_id: node_id,
                    round: 0,
                    force: false,
                }),
                ..Default::default()
            }),
            vote_notify: Notify::new(),
            election_running: AtomicBool::new(false),
            controller,
        })
    }

    pub fn num_of_node(&self) -> u32 {
        self.num_of_node.load(Ordering::SeqCst)
    }

    pub fn quorum(&self) -> u32 {
        self.num_of_node() / 2 + 1
    }

    pub fn controller(&self) -> Option<u32> {
        *self.controller.borrow()
    }

    pub fn controller_watch(&self) -> watch::Receiver<Option<u32>> {
        self.controller.subscribe()
    }

    /// Handles a membership announcement: learn endpoints, grow the
    /// expected cluster size, and kick off an election once the mesh is
    /// complete. Every announcement also grants one forced-reply credit
    /// so a converged node can answer the announcer's votes later.
    pub async fn on_peer_aware(self: &Arc<Self>, aware: &PeerAware) {
        {
            let mut state = self.state.lock().await;
            state.reannounce_budget += 1;
        }
        self.num_of_node
            .fetch_max(aware.num_of_node, Ordering::SeqCst);

        for server in &aware.servers {
            if let Err(e) = self.peers.connect(server).await {
                warn!(
                    target: "strata::cluster",
                    node_id = self.node_id,
                    server = %server,
                    error = %e,
                    "Ignoring bad server entry from announcement"
                );
            }
        }

        let connected = self.peers.connected_count().await;
        let expected = self.num_of_node().saturating_sub(1);
        info!(
            target: "strata::cluster",
            node_id = self.node_id,
            from = aware.node_id,
            connected,
            expected,
            "Peer announcement processed"
        );
        if connected >= expected && expected > 0 {
            let election = Arc::clone(self);
            tokio::spawn(async move { election.run_election().await });
        }
    }

    /// Tallies an incoming vote. A converged node spends one credit to
    /// answer with a forced vote instead.
    pub async fn on_controller_vote(
        &self,
        vote: ControllerVote,
        request: &Packet,
        connection: &Connection,
    ) {
        let reply = self.accept_vote(vote).await;

        if let Some(forced) = reply {
            debug!(
                target: "strata::cluster",
                node_id = self.node_id,
                controller = forced.controller_id,
                "Answering late vote with settled controller"
            );
            let response = Packet::new(PacketType::ControllerVote, forced.to_bytes());
            if let Err(e) = connection.reply_to(request, response).await {
                warn!(
                    target: "strata::cluster",
                    node_id = self.node_id,
                    error = %e,
                    "Failed to send forced vote reply"
                );
            }
        }
    }

    /// Records one vote, or returns the forced reply it earns. Once the
    /// node has converged the tally is closed: votes either draw a
    /// forced reply (one per remaining credit) or are dropped.
    pub(crate) async fn accept_vote(&self, vote: ControllerVote) -> Option<ControllerVote> {
        let mut state = self.state.lock().await;
        if state.converged {
            if state.reannounce_budget > 0 {
                state.reannounce_budget -= 1;
                return state.current_vote.clone().map(|current| ControllerVote {
                    voter_id: current.voter_id,
                    controller_id: current.controller_id,
                    round: current.round,
                    force: true,
                });
            }
            debug!(
                target: "strata::cluster",
                node_id = self.node_id,
                voter = vote.voter_id,
                "Dropping vote after convergence, no reply credit left"
            );
            return None;
        }

        debug!(
            target: "strata::cluster",
            node_id = self.node_id,
            voter = vote.voter_id,
            candidate = vote.controller_id,
            round = vote.round,
            "Vote received"
        );
        // One ballot per voter: a newer vote replaces the old one so
        // mixed-round ballots are never double-counted.
        state.votes.retain(|other| other.voter_id != vote.voter_id);
        state.votes.push(vote);
        if state.votes.len() as u32 >= self.quorum() {
            self.vote_notify.notify_waiters();
        }
        None
    }

    /// Runs voting rounds until a controller is settled. Only one
    /// instance runs at a time.
    pub async fn run_election(self: &Arc<Self>) {
        if self.election_running.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let vote = {
                let mut state = self.state.lock().await;
                if state.converged {
                    self.election_running.store(false, Ordering::SeqCst);
                    return;
                }
                let Some(vote) = state.current_vote.clone() else {
                    self.election_running.store(false, Ordering::SeqCst);
                    return;
                };
                state.votes.retain(|other| other.voter_id != vote.voter_id);
                state.votes.push(vote.clone());
                vote
            };

            info!(
                target: "strata::cluster",
                node_id = self.node_id,
                candidate = vote.controller_id,
                round = vote.round,
                "Casting controller vote"
            );
            let packet = Packet::new(PacketType::ControllerVote, vote.to_bytes());
            self.peers.broadcast(&packet, None).await;

            let num = self.num_of_node();
            let quorum = self.quorum();
            loop {
                let settled = {
                    let mut state = self.state.lock().await;
                    if let Some(winner) = winning_vote(&state.votes, quorum) {
                        // Forced replies are built from current_vote, so
                        // it must carry the settled controller even when
                        // our own ballot named someone else.
                        state.round = winner.round;
                        state.current_vote = Some(ControllerVote {
                            voter_id: self.node_id,
                            controller_id: winner.controller_id,
                            round: winner.round,
                            force: false,
                        });
                        state.forced = winner.force;
                        state.converged = true;
                        state.votes.clear();
                        Some(winner.controller_id)
                    } else if state.votes.len() as u32 >= num {
                        // Full round without a majority.
                        None
                    } else {
                        drop(state);
                        let notified = self.vote_notify.notified();
                        let _ = tokio::time::timeout(
                            Duration::from_millis(VOTE_WAIT_MS),
                            notified,
                        )
                        .await;
                        continue;
                    }
                };

                match settled {
                    Some(controller_id) => {
                        self.election_running.store(false, Ordering::SeqCst);
                        self.controller.send_replace(Some(controller_id));
                        info!(
                            target: "strata::cluster",
                            node_id = self.node_id,
                            controller = controller_id,
                            "Controller settled"
                        );
                        return;
                    }
                    None => break,
                }
            }

            // Retry with the best candidate from the failed round.
            let mut state = self.state.lock().await;
            let better = better_candidate(&state.votes);
            state.round += 1;
            let round = state.round;
            state.current_vote = Some(ControllerVote {
                voter_id: self.node_id,
                controller_id: better,
                round,
                force: false,
            });
            state.votes.clear();
            info!(
                target: "strata::cluster",
                node_id = self.node_id,
                candidate = better,
                round,
                "Round split, retrying with best candidate"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn vote(voter_id: u32, controller_id: u32) -> ControllerVote {
        ControllerVote {
            voter_id,
            controller_id,
            round: 0,
            force: false,
        }
    }

    #[test]
    fn majority_settles_the_tally() {
        let votes = vec![vote(1, 3), vote(2, 3), vote(3, 1)];
        let winner = winning_vote(&votes, 2).unwrap();
        assert_eq!(winner.controller_id, 3);
    }

    #[test]
    fn no_winner_below_quorum() {
        let votes = vec![vote(1, 3), vote(2, 1)];
        assert!(winning_vote(&votes, 2).is_none());
    }

    #[test]
    fn forced_vote_wins_outright() {
        let forced = ControllerVote {
            voter_id: 2,
            controller_id: 5,
            round: 4,
            force: true,
        };
        let votes = vec![vote(1, 1), forced.clone()];
        assert_eq!(winning_vote(&votes, 3).unwrap(), forced);
    }

    #[test]
    fn split_round_retries_toward_highest_id() {
        // Everyone voted for themselves: no quorum, next candidate is
        // the highest ID seen.
        let votes = vec![vote(1, 1), vote(2, 2), vote(3, 3)];
        assert!(winning_vote(&votes, 2).is_none());
        assert_eq!(better_candidate(&votes), 3);
    }

    #[test]
    fn exact_quorum_is_enough() {
        // Two of four is not a majority, three is.
        let votes = vec![vote(1, 4), vote(2, 4), vote(3, 1)];
        assert!(winning_vote(&votes, 3).is_none());
        let votes = vec![vote(1, 4), vote(2, 4), vote(3, 4), vote(4, 1)];
        assert_eq!(winning_vote(&votes, 3).unwrap().controller_id, 4);
    }

    fn election_with_no_peers(node_id: u32, num_of_node: u32) -> Arc<ControllerElection> {
        let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::channel(8);
        let (event_tx, _event_rx) = tokio::sync::mpsc::unbounded_channel();
        let peers = Arc::new(PeerManager::new(node_id, 0, -1, 1_000, inbound_tx, event_tx));
        ControllerElection::new(node_id, num_of_node, peers)
    }

    fn round_vote(voter_id: u32, controller_id: u32, round: u32) -> ControllerVote {
        ControllerVote {
            voter_id,
            controller_id,
            round,
            force: false,
        }
    }

    #[tokio::test]
    async fn quorum_convergence_updates_forced_reply_ballot() {
        let election = election_with_no_peers(1, 3);
        // Peers already moved to round 1 and agree on node 3 while our
        // own ballot still names ourselves.
        assert!(election.accept_vote(round_vote(2, 3, 1)).await.is_none());
        assert!(election.accept_vote(round_vote(3, 3, 1)).await.is_none());
        election.run_election().await;
        assert_eq!(election.controller(), Some(3));

        // A late joiner announces, then votes; the reply must carry the
        // settled controller, not the stale self-ballot.
        election
            .on_peer_aware(&PeerAware {
                node_id: 2,
                server: "127.0.0.1:9002:2".to_string(),
                num_of_node: 3,
                servers: Vec::new(),
                is_client: true,
            })
            .await;
        let forced = election.accept_vote(round_vote(2, 2, 0)).await.unwrap();
        assert!(forced.force);
        assert_eq!(forced.controller_id, 3);
    }

    #[tokio::test]
    async fn repeat_ballot_from_one_voter_counts_once() {
        let election = election_with_no_peers(1, 3);
        assert!(election.accept_vote(round_vote(2, 2, 0)).await.is_none());
        assert!(election.accept_vote(round_vote(2, 3, 1)).await.is_none());

        let state = election.state.lock().await;
        assert_eq!(state.votes.len(), 1);
        assert_eq!(state.votes[0].controller_id, 3);
    }

    #[tokio::test]
    async fn converged_node_discards_votes_without_credit() {
        let election = election_with_no_peers(1, 3);
        assert!(election.accept_vote(round_vote(2, 3, 1)).await.is_none());
        assert!(election.accept_vote(round_vote(3, 3, 1)).await.is_none());
        election.run_election().await;
        assert_eq!(election.controller(), Some(3));

        // No reply credits earned, so late votes are dropped outright
        // instead of piling up in the tally.
        for _ in 0..10 {
            assert!(election.accept_vote(round_vote(2, 2, 0)).await.is_none());
        }
        assert_eq!(election.state.lock().await.votes.len(), 0);
    }
}
