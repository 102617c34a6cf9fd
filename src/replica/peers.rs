use crate::commitlog::{EntryId, Position};
use crate::replica::controllers::{
    ConfigureController, ControllerFactory, ElectionController, ReplicationController, ReplicationCursor,
};
use crate::replica::replica_api::{PollRequest, VoteRequest};
use tokio::time::Instant;

/// ReplicaId identifies a cluster member; it doubles as the member's endpoint.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Configuration is the membership view. `entry` identifies the configuration log entry it came
/// from; `None` for a bootstrap membership that was never logged.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Configuration {
    pub entry: Option<EntryId>,
    pub members: Vec<ReplicaId>,
}

impl Configuration {
    pub fn new(entry: Option<EntryId>, members: Vec<ReplicaId>) -> Self {
        Configuration { entry, members }
    }

    pub fn contains(&self, member: &ReplicaId) -> bool {
        self.members.contains(member)
    }

    /// True iff `other` came from a later log entry than this one.
    pub(crate) fn is_superseded_by(&self, other: &Configuration) -> bool {
        match (self.entry, other.entry) {
            (_, None) => self.entry.is_none() && self.members.is_empty(),
            (None, Some(_)) => true,
            (Some(mine), Some(theirs)) => theirs.position > mine.position,
        }
    }
}

/// Member is the leader-side (and election-side) view of one peer.
pub(crate) struct Member {
    id: ReplicaId,
    pub(crate) poll: Box<dyn ElectionController<PollRequest>>,
    pub(crate) vote: Box<dyn ElectionController<VoteRequest>>,
    pub(crate) replication: Box<dyn ReplicationController>,
    pub(crate) configure: Box<dyn ConfigureController>,
    pub(crate) match_position: Option<Position>,
    pub(crate) last_contact: Instant,
    pub(crate) failures: u32,
    pub(crate) cursor: ReplicationCursor,
    /// Configuration entry this peer acknowledged via a configure push.
    pub(crate) configured: Option<EntryId>,
}

impl Member {
    fn new(id: ReplicaId, factory: &dyn ControllerFactory, now: Instant) -> Self {
        Member {
            poll: factory.poll_controller(&id),
            vote: factory.vote_controller(&id),
            replication: factory.replication_controller(&id),
            configure: factory.configure_controller(&id),
            id,
            match_position: None,
            last_contact: now,
            failures: 0,
            cursor: ReplicationCursor::default(),
            configured: None,
        }
    }

    pub(crate) fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// Forget everything learned about this peer during a previous leadership.
    pub(crate) fn reset_progress(&mut self, now: Instant) {
        self.match_position = None;
        self.last_contact = now;
        self.failures = 0;
        self.configured = None;
    }

    pub(crate) fn reset_reader_to_last_entry(&mut self, last_entry: Option<EntryId>) {
        self.cursor.seek(last_entry.map(|e| e.position));
    }

    /// Rewind so the next append starts with the entry at `failed_position`.
    pub(crate) fn reset_reader_to_previous_entry(&mut self, failed_position: Option<Position>) {
        self.cursor.seek(failed_position.and_then(|p| p.previous()));
    }
}

/// MemberTable holds every member of the current configuration except the local replica.
#[derive(Default)]
pub(crate) struct MemberTable {
    peers: Vec<Member>,
    // Removed by a configuration change and not yet told about it.
    departed: Vec<Member>,
}

impl MemberTable {
    /// Rebuild to match `members`, keeping progress and controllers of peers that remain.
    pub(crate) fn rebuild(
        &mut self,
        me: &ReplicaId,
        members: &[ReplicaId],
        factory: &dyn ControllerFactory,
        now: Instant,
    ) {
        let mut old = std::mem::take(&mut self.peers);
        self.departed.retain(|m| !members.contains(&m.id));
        for id in members.iter().filter(|id| *id != me) {
            let member = match old.iter().position(|m| &m.id == id) {
                Some(i) => old.swap_remove(i),
                None => Member::new(id.clone(), factory, now),
            };
            self.peers.push(member);
        }
        self.departed.extend(old);
    }

    /// Members dropped by configuration changes since the last call.
    pub(crate) fn take_departed(&mut self) -> Vec<Member> {
        std::mem::take(&mut self.departed)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Member> {
        self.peers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.peers.iter_mut()
    }

    pub(crate) fn get_mut(&mut self, id: &ReplicaId) -> Option<&mut Member> {
        self.peers.iter_mut().find(|m| &m.id == id)
    }
}

/// Majority of `cluster_size` voting members.
pub(crate) fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
