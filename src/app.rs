// The dispatcher: a single execution lane that owns the registry.
//
// Every mutation, the periodic persistence pass, and the expiry sweep run
// inside one event loop, so access to any given session is serialized in
// arrival order and read-modify-persist sequences can never interleave.
// The presentation layer talks to the loop through an `EngineHandle`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::DraftingConfig;
use crate::connector;
use crate::db::Database;
use crate::protocol::{CommandEnvelope, EngineError, SessionCommand, SessionSnapshot};
use crate::registry::SessionRegistry;
use crate::rooms::RoomProvider;
use crate::session::state::{DraftSession, SessionError};

/// Owned state of the dispatcher loop.
pub struct Engine {
    pub registry: SessionRegistry,
    pub db: Database,
    pub rooms: Arc<dyn RoomProvider>,
    /// Lifetime applied to newly opened sessions.
    pub session_ttl: chrono::Duration,
    /// When present, every opened session gets a keep-alive connector to
    /// the external drafting service.
    pub drafting: Option<DraftingConfig>,
}

impl Engine {
    pub fn new(
        registry: SessionRegistry,
        db: Database,
        rooms: Arc<dyn RoomProvider>,
        session_ttl: chrono::Duration,
        drafting: Option<DraftingConfig>,
    ) -> Self {
        Engine {
            registry,
            db,
            rooms,
            session_ttl,
            drafting,
        }
    }

    /// Apply one command and return the resulting session view.
    pub async fn apply(&mut self, command: SessionCommand) -> Result<SessionSnapshot, EngineError> {
        match command {
            SessionCommand::Open {
                creator,
                session_type,
                cube_id,
            } => self.open_session(&creator, session_type, &cube_id).await,

            SessionCommand::SignUp {
                session_id,
                participant,
                display_name,
            } => self.with_session(&session_id, |session| {
                session.sign_up(&participant, &display_name)
            }),

            SessionCommand::CancelSignUp {
                session_id,
                participant,
            } => {
                let session = self.session_mut(&session_id)?;
                let now_empty = session.cancel_sign_up(&participant)?;
                if now_empty {
                    info!("session {session_id} has no sign-ups left");
                }
                Ok(SessionSnapshot::of(session))
            }

            SessionCommand::InitiateReadyCheck { session_id } => {
                self.with_session(&session_id, |session| session.initiate_ready_check())
            }

            SessionCommand::MarkReady {
                session_id,
                participant,
            } => self.with_session(&session_id, |session| session.mark_ready(&participant)),

            SessionCommand::MarkNotReady {
                session_id,
                participant,
            } => self.with_session(&session_id, |session| session.mark_not_ready(&participant)),

            SessionCommand::AssignTeam {
                session_id,
                participant,
                display_name,
                side,
            } => self.with_session(&session_id, |session| {
                session
                    .assign_to_team(&participant, &display_name, side)
                    .map(|_| ())
            }),

            SessionCommand::FormTeams { session_id } => self.with_session(&session_id, |session| {
                session.form_teams(&mut rand::thread_rng())
            }),

            SessionCommand::GeneratePairings { session_id } => {
                self.generate_pairings(&session_id).await
            }

            SessionCommand::ReportResult {
                session_id,
                match_number,
                player1_wins,
                player2_wins,
            } => self.with_session(&session_id, |session| {
                session.report_result(match_number, player1_wins, player2_wins)
            }),

            SessionCommand::Complete { session_id, force } => {
                self.with_session(&session_id, |session| session.complete(force))
            }

            SessionCommand::Cancel { session_id } => self.cancel_session(&session_id).await,
        }
    }

    async fn open_session(
        &mut self,
        creator: &str,
        session_type: crate::session::state::SessionType,
        cube_id: &str,
    ) -> Result<SessionSnapshot, EngineError> {
        let session = DraftSession::open(creator, session_type, cube_id, self.session_ttl);
        info!(
            "opening {session_type:?} session {} (draft DB{})",
            session.session_id, session.draft_id
        );

        if let Some(drafting) = &self.drafting {
            connector::spawn(
                drafting.clone(),
                session.session_id.clone(),
                session.draft_id.clone(),
                session.cube_id.clone(),
            );
        }

        let snapshot = SessionSnapshot::of(&session);
        let evicted = self
            .registry
            .add(session, self.rooms.as_ref(), &self.db)
            .await?;
        if let Some(evicted) = evicted {
            info!("session {evicted} evicted to make room");
        }
        Ok(snapshot)
    }

    /// Generate the schedule, then provision the team rooms and the shared
    /// draft room. Room failures are logged and non-fatal; the pairings
    /// stand either way.
    async fn generate_pairings(&mut self, session_id: &str) -> Result<SessionSnapshot, EngineError> {
        let session = self
            .registry
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        session.generate_pairings()?;

        let draft_id = session.draft_id.clone();
        let everyone: Vec<_> = session.sign_ups.keys().cloned().collect();
        let wanted = [
            (format!("Team-A-Chat-{draft_id}"), session.team_a.clone()),
            (format!("Team-B-Chat-{draft_id}"), session.team_b.clone()),
            (format!("Draft-Chat-{draft_id}"), everyone),
        ];

        let rooms = Arc::clone(&self.rooms);
        for (name, members) in wanted {
            match rooms.create(&name, &members).await {
                Ok(room_id) => session.channel_ids.push(room_id),
                Err(e) => warn!("failed to create room {name} for session {session_id}: {e:#}"),
            }
        }

        Ok(SessionSnapshot::of(session))
    }

    async fn cancel_session(&mut self, session_id: &str) -> Result<SessionSnapshot, EngineError> {
        self.session_mut(session_id)?.cancel()?;
        let removed = self
            .registry
            .remove(session_id, self.rooms.as_ref(), &self.db)
            .await?
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        info!("session {session_id} canceled");
        Ok(SessionSnapshot::of(&removed))
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut DraftSession, EngineError> {
        self.registry
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))
    }

    fn with_session<F>(&mut self, session_id: &str, mutate: F) -> Result<SessionSnapshot, EngineError>
    where
        F: FnOnce(&mut DraftSession) -> Result<(), SessionError>,
    {
        let session = self.session_mut(session_id)?;
        mutate(session)?;
        Ok(SessionSnapshot::of(session))
    }
}

// ---------------------------------------------------------------------------
// Handle and event loop
// ---------------------------------------------------------------------------

/// Cloneable entry point the presentation layer uses to reach the
/// dispatcher.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<CommandEnvelope>) -> Self {
        EngineHandle { tx }
    }

    /// Send a command and wait for its result.
    pub async fn execute(&self, command: SessionCommand) -> Result<SessionSnapshot, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(CommandEnvelope { command, reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        response.await.map_err(|_| EngineError::ShuttingDown)?
    }
}

/// Run the dispatcher until every command sender is dropped.
///
/// Commands, the periodic persistence pass, and the expiry sweep all run
/// on this one task; per-session serialization falls out of that. Both
/// intervals fire once immediately, which persists the freshly loaded
/// registry and sweeps anything that expired while the process was down.
pub async fn run(
    mut rx: mpsc::Receiver<CommandEnvelope>,
    mut engine: Engine,
    persist_interval: Duration,
    sweep_interval: Duration,
) -> anyhow::Result<()> {
    let mut persist = tokio::time::interval(persist_interval);
    persist.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Some(CommandEnvelope { command, reply }) => {
                    debug!("dispatching {command:?}");
                    let result = engine.apply(command).await;
                    if reply.send(result).is_err() {
                        debug!("command reply dropped by caller");
                    }
                }
                None => break,
            },
            _ = persist.tick() => {
                match engine.registry.persist_all(&engine.db) {
                    Ok(()) => debug!("persisted {} sessions", engine.registry.len()),
                    Err(e) => error!("periodic persistence failed: {e:#}"),
                }
            }
            _ = sweep.tick() => {
                let swept = engine
                    .registry
                    .sweep_expired(Utc::now(), engine.rooms.as_ref(), &engine.db)
                    .await;
                if !swept.is_empty() {
                    info!("expiry sweep removed {} sessions", swept.len());
                }
            }
        }
    }

    engine
        .registry
        .persist_all(&engine.db)
        .context("final persistence on shutdown")?;
    info!("dispatcher stopped");
    Ok(())
}
