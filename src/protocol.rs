// Commands and read-only snapshots exchanged with the presentation layer.
//
// The engine never formats user-facing text: callers send a typed command
// and get back either a snapshot of the session or a typed error to render
// however they like.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::session::results::TeamTally;
use crate::session::state::{
    DraftSession, ReadyVote, SessionError, SessionType, Stage, TeamSide,
};
use crate::session::ParticipantId;

/// Every mutation the presentation layer can request, matched exhaustively
/// by the dispatcher.
#[derive(Debug)]
pub enum SessionCommand {
    Open {
        creator: ParticipantId,
        session_type: SessionType,
        cube_id: String,
    },
    SignUp {
        session_id: String,
        participant: ParticipantId,
        display_name: String,
    },
    CancelSignUp {
        session_id: String,
        participant: ParticipantId,
    },
    InitiateReadyCheck {
        session_id: String,
    },
    MarkReady {
        session_id: String,
        participant: ParticipantId,
    },
    MarkNotReady {
        session_id: String,
        participant: ParticipantId,
    },
    AssignTeam {
        session_id: String,
        participant: ParticipantId,
        display_name: String,
        side: TeamSide,
    },
    FormTeams {
        session_id: String,
    },
    GeneratePairings {
        session_id: String,
    },
    ReportResult {
        session_id: String,
        match_number: u32,
        player1_wins: u8,
        player2_wins: u8,
    },
    Complete {
        session_id: String,
        force: bool,
    },
    Cancel {
        session_id: String,
    },
}

/// A command plus the channel its result is returned on.
pub struct CommandEnvelope {
    pub command: SessionCommand,
    pub reply: oneshot::Sender<Result<SessionSnapshot, EngineError>>,
}

/// Errors surfaced to the presentation layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("the engine is shutting down")]
    ShuttingDown,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SignUpEntry {
    pub participant: ParticipantId,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReadyCounts {
    pub ready: usize,
    pub not_ready: usize,
    pub no_response: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchSnapshot {
    pub match_number: u32,
    pub player1: ParticipantId,
    pub player2: ParticipantId,
    pub player1_wins: u8,
    pub player2_wins: u8,
    pub winner: Option<ParticipantId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundSnapshot {
    pub round: u8,
    pub matches: Vec<MatchSnapshot>,
}

/// Read-only view of one session for rendering. Everything the
/// notification layer shows comes from here.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub draft_id: String,
    pub draft_link: String,
    pub session_type: SessionType,
    pub stage: Stage,
    pub sign_ups: Vec<SignUpEntry>,
    pub team_a: Vec<ParticipantId>,
    pub team_b: Vec<ParticipantId>,
    pub ready: Option<ReadyCounts>,
    pub rounds: Vec<RoundSnapshot>,
    pub tally: TeamTally,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn of(session: &DraftSession) -> Self {
        let sign_ups = session
            .sign_ups
            .iter()
            .map(|(participant, display_name)| SignUpEntry {
                participant: participant.clone(),
                display_name: display_name.clone(),
            })
            .collect();

        let ready = session.ready_status.as_ref().map(|votes| {
            let mut counts = ReadyCounts::default();
            for vote in votes.values() {
                match vote {
                    ReadyVote::Ready => counts.ready += 1,
                    ReadyVote::NotReady => counts.not_ready += 1,
                    ReadyVote::NoResponse => counts.no_response += 1,
                }
            }
            counts
        });

        let rounds = session
            .pairings
            .iter()
            .map(|(round, pairings)| RoundSnapshot {
                round: *round,
                matches: pairings
                    .iter()
                    .map(|pairing| {
                        let result = session.match_results.get(&pairing.match_number);
                        MatchSnapshot {
                            match_number: pairing.match_number,
                            player1: pairing.player.clone(),
                            player2: pairing.opponent.clone(),
                            player1_wins: result.map_or(0, |r| r.player1_wins),
                            player2_wins: result.map_or(0, |r| r.player2_wins),
                            winner: result.and_then(|r| r.winner_id.clone()),
                        }
                    })
                    .collect(),
            })
            .collect();

        SessionSnapshot {
            session_id: session.session_id.clone(),
            draft_id: session.draft_id.clone(),
            draft_link: session.draft_link(),
            session_type: session.session_type,
            stage: session.stage,
            sign_ups,
            team_a: session.team_a.clone(),
            team_b: session.team_b.clone(),
            ready,
            rounds,
            tally: session.tally(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn full_session() -> DraftSession {
        let mut rng = StdRng::seed_from_u64(3);
        let mut session = DraftSession::new(
            "host",
            SessionType::Random,
            "vintage-cube",
            Utc::now(),
            Duration::hours(7),
            &mut rng,
        );
        for i in 0..6 {
            session.sign_up(&format!("p{i}"), &format!("Player {i}")).unwrap();
        }
        session.form_teams(&mut rng).unwrap();
        session.generate_pairings().unwrap();
        session.report_result(1, 2, 0).unwrap();
        session
    }

    #[test]
    fn snapshot_reflects_session_state() {
        let session = full_session();
        let snapshot = SessionSnapshot::of(&session);

        assert_eq!(snapshot.session_id, session.session_id);
        assert_eq!(snapshot.stage, Stage::Reporting);
        assert_eq!(snapshot.sign_ups.len(), 6);
        assert_eq!(snapshot.team_a.len(), 3);
        assert_eq!(snapshot.team_b.len(), 3);
        assert_eq!(snapshot.rounds.len(), 3);
        assert!(snapshot.ready.is_none());
        assert!(snapshot.draft_link.contains(&snapshot.draft_id));

        let first_round = &snapshot.rounds[0];
        assert_eq!(first_round.round, 1);
        assert_eq!(first_round.matches.len(), 3);
        let reported = &first_round.matches[0];
        assert_eq!(reported.match_number, 1);
        assert_eq!(reported.player1_wins, 2);
        assert_eq!(reported.player2_wins, 0);
        assert!(reported.winner.is_some());

        assert_eq!(snapshot.tally.team_a_wins + snapshot.tally.team_b_wins, 1);
    }

    #[test]
    fn snapshot_counts_ready_votes() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut session = DraftSession::new(
            "host",
            SessionType::Random,
            "vintage-cube",
            Utc::now(),
            Duration::hours(7),
            &mut rng,
        );
        for i in 0..4 {
            session.sign_up(&format!("p{i}"), &format!("Player {i}")).unwrap();
        }
        session.initiate_ready_check().unwrap();
        session.mark_ready("p0").unwrap();
        session.mark_ready("p1").unwrap();
        session.mark_not_ready("p2").unwrap();

        let snapshot = SessionSnapshot::of(&session);
        let ready = snapshot.ready.unwrap();
        assert_eq!(ready.ready, 2);
        assert_eq!(ready.not_ready, 1);
        assert_eq!(ready.no_response, 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snapshot = SessionSnapshot::of(&full_session());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("sign_ups").is_some());
        assert!(json.get("rounds").is_some());
        assert!(json.get("tally").is_some());
    }
}
