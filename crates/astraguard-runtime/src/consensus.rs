//! Quorum consensus across cluster peers.
//!
//! A proposal is broadcast to every participant concurrently; each peer is
//! called through the retry executor under its own `peer:{node}` circuit.
//! Votes are tallied as they arrive and the round resolves as soon as the
//! outcome is known:
//!
//! 1. `QUORUM_REACHED` once one value has `quorum_size` votes
//! 2. once every peer has answered or failed: `SPLIT` if two or more values
//!    were voted, `QUORUM_FAILED` otherwise
//! 3. `QUORUM_FAILED` as soon as no value can reach quorum with the peers
//!    still outstanding
//! 4. `TIMEOUT` when `round_timeout` elapses first; partial votes are discarded
//!
//! Only crash and timeout failures are modelled. Results are cached per
//! proposal id, so proposing the same id again returns the first result
//! without a new round.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use astraguard_core::{ComponentId, NodeId};

use crate::clock::{Clock, SystemClock};
use crate::collaborators::ClusterTransport;
use crate::config::duration_human;
use crate::error::ResilienceError;
use crate::health::HealthMonitor;
use crate::resilience::{BackoffConfig, JitterStrategy, RetryExecutor, RetryPolicy};

/// A peer's vote on a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub node_id: NodeId,
    pub proposal_id: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,

    /// How long the vote stays valid after `timestamp`
    #[serde(with = "duration_human")]
    pub ttl: Duration,
}

impl Vote {
    pub fn new(
        node_id: impl Into<NodeId>,
        proposal_id: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            proposal_id: proposal_id.into(),
            value: value.into(),
            timestamp: Utc::now(),
            ttl,
        }
    }

    /// Whether the vote is still valid at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now <= self.timestamp + ttl,
            Err(_) => true,
        }
    }
}

/// What a peer is asked to vote on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub proposal_id: String,
    pub value: String,
    pub proposer: NodeId,
}

/// A decision that needs cluster agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,

    /// Value proposed, e.g. `"degraded"` for "is node X degraded"
    pub value: String,

    pub participants: Vec<NodeId>,
    pub quorum_size: usize,

    #[serde(with = "duration_human")]
    pub round_timeout: Duration,
}

impl Proposal {
    pub fn new(proposal_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            value: value.into(),
            participants: Vec::new(),
            quorum_size: 1,
            round_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_participants(mut self, participants: impl IntoIterator<Item = NodeId>) -> Self {
        self.participants = participants.into_iter().collect();
        self
    }

    pub fn with_quorum(mut self, quorum_size: usize) -> Self {
        self.quorum_size = quorum_size;
        self
    }

    pub fn with_round_timeout(mut self, round_timeout: Duration) -> Self {
        self.round_timeout = round_timeout;
        self
    }

    /// Participants with duplicates removed, in first-seen order.
    fn unique_participants(&self) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        self.participants
            .iter()
            .filter(|node| seen.insert((*node).clone()))
            .cloned()
            .collect()
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusOutcome {
    QuorumReached,
    QuorumFailed,
    Timeout,
    Split,
}

/// Result of a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub proposal_id: String,

    /// Agreed value, only for `QUORUM_REACHED`
    pub decision: Option<String>,

    pub votes_received: usize,
    pub votes_required: usize,
    pub outcome: ConsensusOutcome,
    pub resolved_at: DateTime<Utc>,
}

impl ConsensusResult {
    /// Callers must take the degraded/unsafe branch unless quorum was reached.
    pub fn assume_unsafe(&self) -> bool {
        self.outcome != ConsensusOutcome::QuorumReached
    }

    /// The error form of a timed-out or split round.
    pub fn error(&self) -> Option<ResilienceError> {
        match self.outcome {
            ConsensusOutcome::Timeout => Some(ResilienceError::ConsensusTimeout {
                proposal_id: self.proposal_id.clone(),
            }),
            ConsensusOutcome::Split => Some(ResilienceError::ConsensusSplit {
                proposal_id: self.proposal_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Consensus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Retry policy for each peer's vote request
    pub peer_retry: RetryPolicy,

    /// Resolved rounds remembered for idempotence
    pub result_cache_capacity: u64,

    #[serde(with = "duration_human")]
    pub result_ttl: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            peer_retry: RetryPolicy {
                max_attempts: 2,
                backoff: BackoffConfig {
                    base_delay: Duration::from_millis(50),
                    max_delay: Duration::from_millis(500),
                    jitter: JitterStrategy::Full,
                },
                ..Default::default()
            },
            result_cache_capacity: 10_000,
            result_ttl: Duration::from_secs(600),
        }
    }
}

/// Runs consensus rounds over a cluster transport.
pub struct QuorumConsensus {
    node_id: NodeId,
    transport: Arc<dyn ClusterTransport>,
    executor: Arc<RetryExecutor>,
    health: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    config: ConsensusConfig,
    results: Cache<String, ConsensusResult>,
}

impl QuorumConsensus {
    pub fn new(
        node_id: NodeId,
        transport: Arc<dyn ClusterTransport>,
        executor: Arc<RetryExecutor>,
        health: Arc<HealthMonitor>,
        config: ConsensusConfig,
    ) -> Self {
        let results = Cache::builder()
            .max_capacity(config.result_cache_capacity)
            .time_to_live(config.result_ttl)
            .build();

        Self {
            node_id,
            transport,
            executor,
            health,
            clock: Arc::new(SystemClock),
            config,
            results,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Previously resolved result for a proposal, if any.
    pub async fn cached(&self, proposal_id: &str) -> Option<ConsensusResult> {
        self.results.get(proposal_id).await
    }

    /// Resolve a proposal, or return the cached result for its id.
    ///
    /// Fails only for malformed proposals.
    #[tracing::instrument(skip_all, fields(proposal_id = %proposal.proposal_id))]
    pub async fn propose(&self, proposal: Proposal) -> Result<ConsensusResult, ResilienceError> {
        let participants = proposal.unique_participants();
        if proposal.proposal_id.is_empty() {
            return Err(ResilienceError::Input("proposal_id must not be empty".to_string()));
        }
        if proposal.quorum_size == 0 || proposal.quorum_size > participants.len() {
            return Err(ResilienceError::Input(format!(
                "quorum_size {} must be within 1..={} participants",
                proposal.quorum_size,
                participants.len()
            )));
        }
        if proposal.round_timeout.is_zero() {
            return Err(ResilienceError::Input("round_timeout must be positive".to_string()));
        }

        // Concurrent proposals for the same id share one round
        let result = self
            .results
            .get_with(
                proposal.proposal_id.clone(),
                self.run_round(&proposal, &participants),
            )
            .await;
        Ok(result)
    }

    async fn run_round(&self, proposal: &Proposal, participants: &[NodeId]) -> ConsensusResult {
        let deadline = tokio::time::Instant::now() + proposal.round_timeout;
        let request = VoteRequest {
            proposal_id: proposal.proposal_id.clone(),
            value: proposal.value.clone(),
            proposer: self.node_id.clone(),
        };

        let request = &request;
        let mut pending: FuturesUnordered<_> = participants
            .iter()
            .map(|peer| async move {
                let transport = &self.transport;
                let result = self
                    .executor
                    .execute(
                        &ComponentId::peer(peer),
                        &self.config.peer_retry,
                        None,
                        move |_| transport.send_vote_request(peer, request),
                    )
                    .await;
                (peer, result)
            })
            .collect();

        let total = participants.len();
        let quorum = proposal.quorum_size;
        let mut tally: BTreeMap<String, usize> = BTreeMap::new();
        let mut received = 0;
        let mut settled = 0;

        let (outcome, decision) = loop {
            let (peer, result) = match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(settled_peer)) => settled_peer,
                // Unreachable with a non-empty participant list
                Ok(None) => break (ConsensusOutcome::QuorumFailed, None),
                Err(_) => break (ConsensusOutcome::Timeout, None),
            };
            settled += 1;

            match result {
                Ok(vote) if self.accepts(&vote, peer, &proposal.proposal_id) => {
                    received += 1;
                    *tally.entry(vote.value).or_default() += 1;
                }
                Ok(vote) => {
                    tracing::debug!(peer = %peer, voter = %vote.node_id, "Discarding invalid or expired vote");
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "No vote from peer");
                }
            }

            let leader = tally
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(value, count)| (value.clone(), *count));
            let best = leader.as_ref().map_or(0, |(_, count)| *count);

            if let Some((value, count)) = leader.filter(|(_, count)| *count >= quorum) {
                tracing::info!(decision = %value, votes = count, "Quorum reached");
                break (ConsensusOutcome::QuorumReached, Some(value));
            }
            if settled == total {
                if tally.len() >= 2 {
                    break (ConsensusOutcome::Split, None);
                }
                break (ConsensusOutcome::QuorumFailed, None);
            }
            if best + (total - settled) < quorum {
                break (ConsensusOutcome::QuorumFailed, None);
            }
        };

        // Stragglers are cancelled with the round; their votes never count
        drop(pending);

        let result = ConsensusResult {
            proposal_id: proposal.proposal_id.clone(),
            decision,
            votes_received: received,
            votes_required: quorum,
            outcome,
            resolved_at: self.clock.wall(),
        };
        self.health.record_consensus(&result);
        result
    }

    fn accepts(&self, vote: &Vote, asked: &NodeId, proposal_id: &str) -> bool {
        vote.proposal_id == proposal_id && &vote.node_id == asked && vote.is_live(self.clock.wall())
    }
}
