use crate::replica::peers::ReplicaId;
use std::fmt;

/// Term is a raft leadership term. It never decreases.
#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever raft requires that something is persisted to a
/// durable store to guarantee safety: the current term and the vote cast in it.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state.
pub trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term. Clears the
    /// vote, since it belonged to the old term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> bool;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> bool;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Term;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<ReplicaId>);
}

// Not persistent, just in memory. Good enough for tests and for replicas that rejoin with an empty
// log.
// TODO:3 Persist local state to disk, not RAM.
pub struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<ReplicaId>,
    my_replica_id: ReplicaId,
}

impl VolatileLocalState {
    pub fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id,
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> bool {
        if new_term <= self.current_term {
            false
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            true
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> bool {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(vote);
            true
        } else {
            false
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        self.current_term
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<ReplicaId>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}
