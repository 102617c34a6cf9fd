use crate::replica::peers::majority;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum QuorumOutcome {
    Granted,
    Denied,
}

/// QuorumTracker counts responses for one round against a majority of `cluster_size`. It is
/// terminal once the outcome is decided: either a majority granted, or enough denied that a
/// majority can no longer be reached.
#[derive(Debug)]
pub(crate) struct QuorumTracker {
    cluster_size: usize,
    needed: usize,
    granted: usize,
    denied: usize,
    outcome: Option<QuorumOutcome>,
}

impl QuorumTracker {
    pub(crate) fn open(cluster_size: usize) -> Self {
        QuorumTracker {
            cluster_size,
            needed: majority(cluster_size),
            granted: 0,
            denied: 0,
            outcome: None,
        }
    }

    pub(crate) fn succeed(&mut self) {
        if self.outcome.is_none() {
            self.granted += 1;
            self.evaluate();
        }
    }

    pub(crate) fn fail(&mut self) {
        if self.outcome.is_none() {
            self.denied += 1;
            self.evaluate();
        }
    }

    pub(crate) fn outcome(&self) -> Option<QuorumOutcome> {
        self.outcome
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    fn evaluate(&mut self) {
        if self.granted >= self.needed {
            self.outcome = Some(QuorumOutcome::Granted);
        } else if self.denied > self.cluster_size - self.needed {
            self.outcome = Some(QuorumOutcome::Denied);
        }
    }
}
