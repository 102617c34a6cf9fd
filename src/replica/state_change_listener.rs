use crate::replica::peers::ReplicaId;
use tokio::sync::watch;

/// The replica's role as last observed. Intermediate snapshots may be skipped by slow listeners;
/// only the most recent one is kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleSnapshot {
    Inactive,
    Follower { leader: Option<ReplicaId> },
    Candidate,
    Leader,
}

pub(super) fn new(initial_state: RoleSnapshot) -> (RoleChangeNotifier, RoleChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (RoleChangeNotifier { snd }, RoleChangeListener { rcv })
}

pub(super) struct RoleChangeNotifier {
    snd: watch::Sender<RoleSnapshot>,
}

impl RoleChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: RoleSnapshot) {
        let _ = self.snd.send(new_state);
    }
}

#[derive(Clone)]
pub struct RoleChangeListener {
    rcv: watch::Receiver<RoleSnapshot>,
}

impl RoleChangeListener {
    /// Waits for the next role change. `None` once the replica is gone.
    pub async fn next(&mut self) -> Option<RoleSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub fn current(&self) -> RoleSnapshot {
        self.rcv.borrow().clone()
    }
}
