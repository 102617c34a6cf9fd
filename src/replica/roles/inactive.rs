use crate::replica::raft_rpcs;
use crate::replica::replica_api::{ConfigureRequest, ConfigureResponse};
use crate::replica::replica_state::ReplicaState;
use crate::replica::roles::{Lifecycle, RoleKind};

/// Inactive replicas hold no membership and take no part in the protocol. The only thing they
/// accept is a configuration push, which makes them a member.
pub(crate) struct Inactive {
    lifecycle: Lifecycle,
}

impl Inactive {
    pub(super) fn new() -> Self {
        Inactive {
            lifecycle: Lifecycle::Closed,
        }
    }

    pub(super) fn open(&mut self, state: &mut ReplicaState) {
        assert_eq!(self.lifecycle, Lifecycle::Closed, "Opened a role that wasn't closed");
        self.lifecycle = Lifecycle::Open;
        state.notify_role_opened();
    }

    pub(super) fn do_work(&mut self, _state: &mut ReplicaState) -> usize {
        0
    }

    pub(super) fn close(&mut self, _state: &mut ReplicaState) {
        self.lifecycle = Lifecycle::Closed;
    }

    pub(super) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(super) fn configure(&mut self, state: &mut ReplicaState, request: ConfigureRequest) -> ConfigureResponse {
        state.update_term_and_leader(request.term, None);
        let response = raft_rpcs::handle_configure(state, &request);

        if state.configuration().contains(&state.me) {
            slog::info!(state.logger, "Joined configuration {:?}", state.configuration());
            state.request_transition(RoleKind::Follower);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use crate::commitlog::{EntryId, Position};
    use crate::replica::test_utils::TestHarness;
    use crate::replica::{
        Configuration, ConfigureRequest, MembershipRequest, PollRequest, ReplicaId, RoleKind, RpcError, Term,
    };

    #[test]
    fn protocol_rpcs_are_illegal() {
        let mut harness = TestHarness::inactive("me");

        let poll = harness.replica.poll(PollRequest {
            term: Term::new(1),
            candidate: ReplicaId::new("a"),
            last_entry: None,
        });
        assert!(matches!(
            poll,
            Err(RpcError::IllegalState {
                role: RoleKind::Inactive,
                ..
            })
        ));

        let join = harness.replica.join(MembershipRequest {
            member: ReplicaId::new("a"),
        });
        assert!(matches!(join, Err(ref e) if e.is_fatal()));
        assert_eq!(harness.replica.do_work(), 0);
    }

    #[test]
    fn configure_makes_it_a_follower() {
        let mut harness = TestHarness::inactive("me");
        let configuration = Configuration::new(
            Some(EntryId::new(Position::new(3), Term::new(2))),
            vec![ReplicaId::new("a"), ReplicaId::new("me")],
        );

        let response = harness
            .replica
            .configure(ConfigureRequest {
                term: Term::new(2),
                configuration: configuration.clone(),
            })
            .unwrap();

        assert_eq!(response.term, Term::new(2));
        assert_eq!(harness.replica.configuration(), &configuration);
        harness.replica.do_work();
        assert_eq!(harness.replica.role(), RoleKind::Follower);
    }

    #[test]
    fn configure_without_me_stays_inactive() {
        let mut harness = TestHarness::inactive("me");
        harness
            .replica
            .configure(ConfigureRequest {
                term: Term::new(1),
                configuration: Configuration::new(
                    Some(EntryId::new(Position::new(1), Term::new(1))),
                    vec![ReplicaId::new("a")],
                ),
            })
            .unwrap();

        harness.replica.do_work();
        assert_eq!(harness.replica.role(), RoleKind::Inactive);
    }
}
