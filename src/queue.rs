//! Single-flight FIFO of claims awaiting attestation.

use std::collections::VecDeque;

use crate::claim::Claim;
use crate::proof::{AttestorProof, GeneratedProofs};

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedClaim {
    pub request_hash: String,
    pub claim: Claim,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    InFlight(String),
}

/// Queue plus the proofs it has produced. At most one claim is in flight at
/// a time; the caller drives draining with [`ProofQueue::begin_next`] and
/// [`ProofQueue::finish`].
#[derive(Debug)]
pub struct ProofQueue {
    pending: VecDeque<QueuedClaim>,
    state: DrainState,
    generated: GeneratedProofs,
}

impl Default for ProofQueue {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            state: DrainState::Idle,
            generated: GeneratedProofs::default(),
        }
    }
}

impl ProofQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a claim. Returns true when nothing is in flight, meaning the
    /// caller should start draining.
    pub fn enqueue(&mut self, request_hash: impl Into<String>, claim: Claim) -> bool {
        self.pending.push_back(QueuedClaim {
            request_hash: request_hash.into(),
            claim,
        });
        self.state == DrainState::Idle
    }

    /// Takes the next claim and marks it in flight. `None` while another
    /// claim is in flight or when the queue is empty.
    pub fn begin_next(&mut self) -> Option<QueuedClaim> {
        if self.state != DrainState::Idle {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.state = DrainState::InFlight(next.request_hash.clone());
        Some(next)
    }

    /// Ends the in-flight item. Returns its hash, or `None` when nothing was
    /// in flight.
    pub fn finish(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, DrainState::Idle) {
            DrainState::InFlight(hash) => Some(hash),
            DrainState::Idle => None,
        }
    }

    /// First writer wins; returns false for a hash that already has a proof.
    pub fn record_proof(&mut self, request_hash: &str, proof: AttestorProof) -> bool {
        self.generated.record(request_hash, proof)
    }

    pub fn all_required_satisfied(&self, required: &[&str]) -> bool {
        required.iter().all(|hash| self.generated.contains(hash))
    }

    pub fn generated(&self) -> &GeneratedProofs {
        &self.generated
    }

    pub fn state(&self) -> &DrainState {
        &self.state
    }

    pub fn in_flight(&self) -> Option<&str> {
        match &self.state {
            DrainState::InFlight(hash) => Some(hash),
            DrainState::Idle => None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops queued claims and forgets the in-flight one. Recorded proofs
    /// stay.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.state = DrainState::Idle;
    }

    pub fn reset(&mut self) {
        self.clear();
        self.generated.clear();
    }
}
