//! The constituent: the per-peer role machine.
//!
//! Owns the durable `(current_term, voted_for)` pair and the volatile role,
//! leader id and heartbeat clock. The agent owns everything else; the
//! constituent reaches back into it only through the narrow
//! [`LeadershipHook`] capability.
//!
//! Term discipline is centralized here: any observation of a higher term,
//! from any RPC in any direction, adopts that term, clears the vote and
//! demotes to follower. A vote or an adopted term is persisted through the
//! log store before the corresponding reply can leave the peer, so a
//! crashed-then-recovered peer cannot vote twice in one term.

use crate::config::AgencyConfig;
use crate::error::{AgencyError, Result};
use crate::log::LogStore;
use crate::transport::Transport;
use crate::types::*;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast;

/// What the constituent needs from its agent, and nothing more.
pub trait LeadershipHook: Send + Sync {
    /// Rebuild the agent's stores from the log. Runs after an election is
    /// won and before the new role becomes visible, so no write is accepted
    /// against a stale spearhead.
    fn rebuild_for_lead(&self);

    /// The new role is visible; start replicating.
    fn lead_acquired(&self);

    /// Snapshot of the endpoint table, gossiped inside vote solicitations.
    fn endpoints(&self) -> Vec<String>;
}

struct RoleState {
    role: Role,
    current_term: Term,
    voted_for: Option<PeerId>,
    leader_id: Option<PeerId>,
    last_heartbeat: Instant,
}

/// The role machine for one peer.
pub struct Constituent {
    id: PeerId,
    config: AgencyConfig,
    log: Arc<LogStore>,
    state: Mutex<RoleState>,
}

impl Constituent {
    /// Restore from the persisted `(term, voted_for)` pair. Every peer
    /// starts as a follower.
    pub fn new(
        config: AgencyConfig,
        log: Arc<LogStore>,
        term: Term,
        voted_for: Option<PeerId>,
    ) -> Self {
        Self {
            id: config.id,
            config,
            log,
            state: Mutex::new(RoleState {
                role: Role::Follower,
                current_term: term,
                voted_for,
                leader_id: None,
                last_heartbeat: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.state.lock().current_term
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn leading(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// The leader this peer currently believes in, if any.
    pub fn leader_id(&self) -> Option<PeerId> {
        self.state.lock().leader_id
    }

    /// Handle a vote solicitation.
    ///
    /// Grants iff we have not voted for someone else this term and the
    /// candidate's log is at least as up-to-date as ours: its last term is
    /// higher, or equal with a last index no smaller. Any change to the
    /// term/vote pair is persisted before the response is returned.
    pub fn vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (last_log_index, last_log_term) =
            self.log.last().unwrap_or((LogIndex::ZERO, Term::ZERO));

        let mut s = self.state.lock();
        let mut dirty = false;
        if request.term > s.current_term {
            step_down(&mut s, request.term);
            dirty = true;
        }

        let mut granted = false;
        if request.term >= s.current_term {
            let unspoken = s.voted_for.map_or(true, |v| v == request.candidate_id);
            let up_to_date = request.last_log_term > last_log_term
                || (request.last_log_term == last_log_term
                    && request.last_log_index >= last_log_index);
            if unspoken && up_to_date {
                dirty |= s.voted_for != Some(request.candidate_id);
                granted = true;
                s.voted_for = Some(request.candidate_id);
                s.last_heartbeat = Instant::now();
            }
        }

        if dirty {
            self.log.save_vote(s.current_term, s.voted_for)?;
        }

        tracing::debug!(
            candidate = %request.candidate_id,
            term = %request.term,
            granted,
            "vote solicitation"
        );
        Ok(RequestVoteResponse {
            term: s.current_term,
            vote_granted: granted,
        })
    }

    /// Register a live leader for `term` (append-entries ingest path).
    ///
    /// Fails with `StaleTerm` when the caller's term is behind ours; adopts
    /// a higher term; in all accepted cases resets the election clock and
    /// demotes a candidate or a rival leader to follower.
    pub fn note_leader(&self, term: Term, leader: PeerId) -> Result<()> {
        let mut s = self.state.lock();
        if term > s.current_term {
            step_down(&mut s, term);
            self.log.save_vote(s.current_term, s.voted_for)?;
        }
        if term < s.current_term {
            return Err(AgencyError::StaleTerm {
                current: s.current_term,
                request: term,
            });
        }
        s.last_heartbeat = Instant::now();
        s.leader_id = Some(leader);
        if s.role != Role::Follower {
            if s.role == Role::Leader {
                tracing::warn!(term = %term, leader = %leader, "yielding leadership");
            }
            s.role = Role::Follower;
        }
        Ok(())
    }

    /// Adopt a higher term seen in an RPC response. Returns whether we
    /// stepped down.
    pub fn observe_term(&self, term: Term) -> Result<bool> {
        let mut s = self.state.lock();
        if term <= s.current_term {
            return Ok(false);
        }
        tracing::info!(ours = %s.current_term, theirs = %term, "higher term observed, stepping down");
        step_down(&mut s, term);
        self.log.save_vote(s.current_term, s.voted_for)?;
        Ok(true)
    }

    /// No valid heartbeat within `timeout`?
    fn election_due(&self, timeout: std::time::Duration) -> bool {
        let s = self.state.lock();
        s.role != Role::Leader && s.last_heartbeat.elapsed() >= timeout
    }

    /// Open a new term as candidate: bump the term, vote for ourselves,
    /// persist, reset the election clock.
    fn start_campaign(&self) -> Result<(Term, LogIndex, Term)> {
        let (last_log_index, last_log_term) =
            self.log.last().unwrap_or((LogIndex::ZERO, Term::ZERO));
        let mut s = self.state.lock();
        s.current_term = s.current_term.next();
        s.voted_for = Some(self.id);
        s.role = Role::Candidate;
        s.leader_id = None;
        s.last_heartbeat = Instant::now();
        self.log.save_vote(s.current_term, s.voted_for)?;
        Ok((s.current_term, last_log_index, last_log_term))
    }

    fn still_candidate(&self, term: Term) -> bool {
        let s = self.state.lock();
        s.role == Role::Candidate && s.current_term == term
    }

    /// Flip candidate → leader, unless the candidacy died meanwhile.
    fn try_assume_leadership(&self, term: Term) -> bool {
        let mut s = self.state.lock();
        if s.role == Role::Candidate && s.current_term == term {
            s.role = Role::Leader;
            s.leader_id = Some(self.id);
            true
        } else {
            false
        }
    }

    /// Force a role for agent-internal tests.
    #[cfg(test)]
    pub(crate) fn force_lead(&self, term: Term) {
        let mut s = self.state.lock();
        s.current_term = term;
        s.role = Role::Leader;
        s.leader_id = Some(self.id);
    }
}

fn step_down(s: &mut RoleState, new_term: Term) {
    s.current_term = new_term;
    s.voted_for = None;
    s.role = Role::Follower;
    s.leader_id = None;
    s.last_heartbeat = Instant::now();
}

/// Election driver, one task per agent.
///
/// Sleeps a fresh randomized timeout each round; a stale heartbeat clock
/// opens a campaign. Votes are solicited from every other peer concurrently
/// with a bounded wait, and a strict majority (counting ourselves) makes us
/// leader, after the agent rebuilt its stores.
pub(crate) async fn election_loop(
    constituent: Arc<Constituent>,
    transport: Arc<dyn Transport>,
    hook: Weak<dyn LeadershipHook>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let rpc_timeout = constituent.config.election_timeout_min;
    loop {
        let timeout = constituent.config.random_election_timeout();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = shutdown.recv() => break,
        }
        if !constituent.election_due(timeout) {
            continue;
        }

        let (term, last_log_index, last_log_term) = match constituent.start_campaign() {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!(error = %err, "cannot persist candidacy, elections halted");
                break;
            }
        };
        let Some(hook) = hook.upgrade() else { break };
        tracing::info!(term = %term, "election timeout, soliciting votes");

        let request = RequestVoteRequest {
            term,
            candidate_id: constituent.id(),
            last_log_index,
            last_log_term,
            endpoints: Some(hook.endpoints()),
        };
        let solicitations = constituent.config.others().map(|peer| {
            let transport = transport.clone();
            let request = request.clone();
            async move {
                tokio::time::timeout(rpc_timeout, transport.request_vote(peer, request)).await
            }
        });
        let replies = futures::future::join_all(solicitations).await;

        let mut granted = 1usize; // our own ballot
        for reply in replies {
            let Ok(Ok(response)) = reply else { continue };
            if response.term > term {
                if constituent.observe_term(response.term).is_err() {
                    return;
                }
                continue;
            }
            if response.vote_granted {
                granted += 1;
            }
        }

        if granted >= constituent.config.quorum() && constituent.still_candidate(term) {
            hook.rebuild_for_lead();
            if constituent.try_assume_leadership(term) {
                tracing::info!(term = %term, votes = granted, "won election, leading");
                hook.lead_acquired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryBackend;

    fn constituent(cluster: usize, id: u64) -> Constituent {
        let config = AgencyConfig {
            id: PeerId(id),
            endpoints: (0..cluster).map(|i| format!("local://{i}")).collect(),
            ..Default::default()
        };
        let (log, term, voted_for) = LogStore::open(Box::new(MemoryBackend::new())).unwrap();
        Constituent::new(config, Arc::new(log), term, voted_for)
    }

    fn solicitation(term: u64, candidate: u64, last_index: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term(term),
            candidate_id: PeerId(candidate),
            last_log_index: LogIndex(last_index),
            last_log_term: Term(last_term),
            endpoints: None,
        }
    }

    #[test]
    fn test_initial_state() {
        let c = constituent(3, 0);
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(c.term(), Term::ZERO);
        assert_eq!(c.leader_id(), None);
        assert!(!c.leading());
    }

    #[test]
    fn test_vote_granted_and_term_adopted() {
        let c = constituent(3, 0);
        let response = c.vote(&solicitation(5, 1, 0, 0)).unwrap();
        assert!(response.vote_granted);
        assert_eq!(response.term, Term(5));
        assert_eq!(c.term(), Term(5));
    }

    #[test]
    fn test_vote_rejects_stale_term() {
        let c = constituent(3, 0);
        c.vote(&solicitation(10, 1, 0, 0)).unwrap();
        let response = c.vote(&solicitation(5, 2, 0, 0)).unwrap();
        assert!(!response.vote_granted);
        assert_eq!(response.term, Term(10));
    }

    #[test]
    fn test_one_ballot_per_term() {
        let c = constituent(3, 0);
        assert!(c.vote(&solicitation(4, 1, 0, 0)).unwrap().vote_granted);
        // A rival in the same term is denied...
        assert!(!c.vote(&solicitation(4, 2, 0, 0)).unwrap().vote_granted);
        // ...but the original candidate may ask again.
        assert!(c.vote(&solicitation(4, 1, 0, 0)).unwrap().vote_granted);
    }

    #[test]
    fn test_vote_denied_by_up_to_date_rule() {
        let c = constituent(3, 0);
        c.log
            .append(vec![
                LogEntry::new(LogIndex(1), Term(1), bytes::Bytes::from("a")),
                LogEntry::new(LogIndex(2), Term(2), bytes::Bytes::from("b")),
                LogEntry::new(LogIndex(3), Term(3), bytes::Bytes::from("c")),
                LogEntry::new(LogIndex(4), Term(3), bytes::Bytes::from("d")),
            ])
            .unwrap();

        // Candidate's log ends at term 2 while ours ends at term 3: denied,
        // however long the candidate's log is.
        let response = c.vote(&solicitation(4, 1, 10, 2)).unwrap();
        assert!(!response.vote_granted);

        // Same last term but shorter log: denied.
        let response = c.vote(&solicitation(4, 1, 3, 3)).unwrap();
        assert!(!response.vote_granted);

        // Same last term, same length: granted.
        let response = c.vote(&solicitation(4, 1, 4, 3)).unwrap();
        assert!(response.vote_granted);
    }

    #[test]
    fn test_note_leader_rejects_stale_term() {
        let c = constituent(3, 0);
        c.vote(&solicitation(7, 1, 0, 0)).unwrap();
        let err = c.note_leader(Term(3), PeerId(1)).unwrap_err();
        assert!(matches!(
            err,
            AgencyError::StaleTerm {
                current: Term(7),
                request: Term(3)
            }
        ));
    }

    #[test]
    fn test_leader_steps_down_on_higher_term() {
        let c = constituent(3, 0);
        c.force_lead(Term(4));
        assert!(c.leading());

        c.note_leader(Term(5), PeerId(2)).unwrap();
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(c.term(), Term(5));
        assert_eq!(c.leader_id(), Some(PeerId(2)));
        // The vote cleared with the term adoption.
        assert!(c.vote(&solicitation(5, 1, 0, 0)).unwrap().vote_granted);
    }

    #[test]
    fn test_observe_term_steps_down() {
        let c = constituent(3, 0);
        c.force_lead(Term(4));
        assert!(c.observe_term(Term(6)).unwrap());
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(c.term(), Term(6));
        assert!(!c.observe_term(Term(6)).unwrap());
    }

    #[test]
    fn test_campaign_opens_next_term() {
        let c = constituent(3, 2);
        let (term, last_index, last_term) = c.start_campaign().unwrap();
        assert_eq!(term, Term(1));
        assert_eq!((last_index, last_term), (LogIndex::ZERO, Term::ZERO));
        assert_eq!(c.role(), Role::Candidate);
        assert!(c.still_candidate(Term(1)));

        // A rival candidate in the same term is denied: we voted for
        // ourselves when opening it.
        assert!(!c.vote(&solicitation(1, 0, 0, 0)).unwrap().vote_granted);
    }

    #[test]
    fn test_assume_leadership_only_from_live_candidacy() {
        let c = constituent(3, 0);
        let (term, _, _) = c.start_campaign().unwrap();
        assert!(c.try_assume_leadership(term));
        assert!(c.leading());

        let c = constituent(3, 0);
        let (term, _, _) = c.start_campaign().unwrap();
        // A live leader demotes the candidacy first.
        c.note_leader(term, PeerId(1)).unwrap();
        assert!(!c.try_assume_leadership(term));
        assert!(!c.leading());
    }
}
