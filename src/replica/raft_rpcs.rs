//! Request handling shared by the active roles. Callers adopt the request's term (and step down
//! if told to) before delegating here.
use crate::commitlog::EntryId;
use crate::replica::log_buffer::LogBufferError;
use crate::replica::replica_api::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, ElectionResponse, PollRequest, RpcError,
    VoteRequest,
};
use crate::replica::replica_state::ReplicaState;

/// Pre-vote: would we vote for this candidate? Never persists anything.
pub(super) fn handle_poll(state: &ReplicaState, request: &PollRequest, leader_alive: bool) -> ElectionResponse {
    let term = state.term();
    let granted = request.term >= term
        && !leader_alive
        && EntryId::is_at_least_as_up_to_date_as(request.last_entry, state.last_entry());

    slog::debug!(
        state.logger,
        "Poll from {:?} (term {:?}, last {:?}): granted={}",
        request.candidate,
        request.term,
        request.last_entry,
        granted
    );
    ElectionResponse { term, granted }
}

/// Binding vote: once per term, and only for a candidate whose log is at least as up to date.
pub(super) fn handle_vote(state: &mut ReplicaState, request: &VoteRequest) -> ElectionResponse {
    let term = state.term();
    if request.term != term {
        // Stale candidate. (Newer terms were adopted by the caller.)
        return ElectionResponse { term, granted: false };
    }

    if !EntryId::is_at_least_as_up_to_date_as(request.last_entry, state.last_entry()) {
        slog::debug!(
            state.logger,
            "Denying vote to {:?}: log {:?} is behind mine {:?}",
            request.candidate,
            request.last_entry,
            state.last_entry()
        );
        return ElectionResponse { term, granted: false };
    }

    let granted = match state.voted_for() {
        Some(voted_for) => voted_for == request.candidate,
        None => state.store_vote(term, request.candidate.clone()),
    };

    slog::info!(state.logger, "Vote for {:?} in term {:?}: granted={}", request.candidate, term, granted);
    ElectionResponse { term, granted }
}

/// Reconciles our log with the leader's and stages+flushes new entries.
pub(super) fn handle_append(state: &mut ReplicaState, request: &AppendRequest) -> Result<AppendResponse, RpcError> {
    let term = state.term();
    if request.term < term {
        return Ok(failed_append(state, request));
    }

    // Leftovers from a failed flush must be durable before we can acknowledge anything after them.
    if state.log.has_buffered_entries() {
        if let Err(e) = state.log.flush() {
            slog::warn!(state.logger, "Retrying flush of buffered entries failed: {:?}", e);
            return Ok(failed_append(state, request));
        }
    }

    let previous = request.previous_entry;
    if !state.log.is_last_received_entry(previous) && !state.log.contains_entry(previous).map_err(fatal)? {
        slog::debug!(
            state.logger,
            "Missing previous entry {:?}; last entry is {:?}",
            previous,
            state.log.last_received()
        );
        return Ok(failed_append(state, request));
    }

    let mut last_matched = previous;
    for entry in request.entries.iter() {
        if !state.log.is_last_received_entry(last_matched) {
            // There is more log after `last_matched`; keep what agrees, truncate at the first
            // conflict.
            if state.log.contains_entry(Some(entry.id())).map_err(fatal)? {
                last_matched = Some(entry.id());
                continue;
            }
            slog::info!(
                state.logger,
                "Conflict at {:?}; truncating after {:?}",
                entry.id(),
                last_matched
            );
            state.log.set_last_written_entry(last_matched).map_err(fatal)?;
        }

        if let Err(e) = state.log.append(entry) {
            slog::warn!(state.logger, "Failed to stage {:?}: {:?}", entry.id(), e);
            state.log.discard_buffered_entries();
            return Ok(failed_append(state, request));
        }
        last_matched = Some(entry.id());
    }

    if let Err(e) = state.log.flush() {
        // Entries stay buffered; the leader retries and we flush them first next time.
        slog::warn!(state.logger, "Flush failed: {:?}", e);
        return Ok(failed_append(state, request));
    }

    // Only positions we hold and know to match the leader may become committed here.
    if let (Some(leader_commit), Some(matched)) = (request.commit_position, last_matched) {
        state.ratchet_commit_position(leader_commit.min(matched.position));
    }

    Ok(AppendResponse {
        term: state.term(),
        member: state.me.clone(),
        succeeded: true,
        position: last_matched.map(|e| e.position),
    })
}

/// Adopts a configuration pushed by the leader, if it is newer than ours.
pub(super) fn handle_configure(state: &mut ReplicaState, request: &ConfigureRequest) -> ConfigureResponse {
    if request.term >= state.term() {
        state.apply_configuration(request.configuration.clone());
    }

    ConfigureResponse { term: state.term() }
}

pub(super) fn failed_append(state: &ReplicaState, request: &AppendRequest) -> AppendResponse {
    AppendResponse {
        term: state.term(),
        member: state.me.clone(),
        succeeded: false,
        position: request.previous_entry.map(|e| e.position),
    }
}

fn fatal(error: LogBufferError) -> RpcError {
    RpcError::Fatal(error)
}
