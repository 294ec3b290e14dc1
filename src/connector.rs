// Keep-alive connector for the external drafting service.
//
// One instance runs per session that needs a live bridge: it connects,
// requests the cube import (retried with exponential backoff), then holds
// the session open until enough other participants have joined. The
// message pump is generic over the stream and sink types so it can be
// tested with in-memory streams without opening sockets.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::DraftingConfig;

/// Where the connector currently is in its lifecycle. Used for logging;
/// the transitions are driven by `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    ConfiguringImport,
    WaitingForQuorum,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("failed to connect to the drafting service: {0}")]
    Connect(#[source] WsError),

    #[error("cube import not acknowledged after {attempts} attempts")]
    ImportFailed { attempts: u32 },

    #[error("connection lost before quorum was reached")]
    ConnectionLost,
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outbound<'a> {
    #[serde(rename_all = "camelCase")]
    ImportCube {
        service: &'a str,
        #[serde(rename = "cubeID")]
        cube_id: &'a str,
        match_versions: bool,
    },
    GetUsers,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Inbound {
    ImportAck,
    ImportError { error: String },
    SessionUsers { users: Vec<PresenceUser> },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct PresenceUser {
    #[serde(rename = "userID")]
    user_id: String,
}

/// Serialize an outbound message. The variants hold only strings and
/// bools, which cannot fail to serialize.
fn encode(message: &Outbound<'_>) -> String {
    serde_json::to_string(message).expect("outbound message serialization cannot fail")
}

/// Parse an inbound text frame; anything unrecognized becomes `Unknown`.
fn parse(text: &str) -> Inbound {
    serde_json::from_str(text).unwrap_or(Inbound::Unknown)
}

fn count_others(users: &[PresenceUser], bot_user: &str) -> usize {
    users.iter().filter(|user| user.user_id != bot_user).count()
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Spawn a connector as a detached task.
///
/// Failures stay inside the task: they are logged and can never fail the
/// session the connector serves.
pub fn spawn(
    config: DraftingConfig,
    session_id: String,
    draft_id: String,
    cube_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match run(&config, &session_id, &draft_id, &cube_id).await {
            Ok(()) => {}
            Err(e) => warn!("keep-alive connector for session {session_id} ended: {e}"),
        }
    })
}

/// Connect to the drafting service and hold the session open until quorum.
///
/// Terminal per instance: whatever the outcome, this connector will not
/// reconnect; the caller creates a new one if a retry is desired. Every
/// exit path attempts a best-effort close frame, and cancelling the task
/// drops the socket, which closes the underlying connection.
pub async fn run(
    config: &DraftingConfig,
    session_id: &str,
    draft_id: &str,
    cube_id: &str,
) -> Result<(), ConnectorError> {
    let url = format!(
        "{}?userID={}&sessionID=DB{}&userName={}",
        config.service_url, config.bot_user, draft_id, config.bot_user
    );

    debug!(state = ?ConnectorState::Connecting, "connector for session {session_id} dialing DB{draft_id}");
    let (socket, _response) = connect_async(url).await.map_err(ConnectorError::Connect)?;
    info!(state = ?ConnectorState::Connected, "connector for session {session_id} connected to DB{draft_id}");

    let (mut sink, mut stream) = socket.split();
    let result = drive(&mut sink, &mut stream, config, cube_id).await;

    // Best-effort disconnect. A late failure here must not mask the
    // original outcome.
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("close frame for DB{draft_id} not delivered: {e}");
    }
    match &result {
        Ok(()) => {
            info!(state = ?ConnectorState::Disconnected, "connector for session {session_id} done: quorum reached");
        }
        Err(e) => {
            warn!(state = ?ConnectorState::Disconnected, "connector for session {session_id} ended without quorum: {e}");
        }
    }
    result
}

/// Drive an established connection through import and quorum wait.
pub async fn drive<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    config: &DraftingConfig,
    cube_id: &str,
) -> Result<(), ConnectorError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut others_seen = 0;
    import_cube(sink, stream, config, cube_id, &mut others_seen).await?;
    wait_for_quorum(sink, stream, config, others_seen).await
}

// ---------------------------------------------------------------------------
// Import with backoff
// ---------------------------------------------------------------------------

enum AckOutcome {
    Acked,
    TimedOut,
}

/// Request the cube import until acknowledged or attempts are exhausted.
///
/// Attempt `i` waits out a window of `base * 2^i` plus up to one second of
/// jitter before the request is considered failed, so the windows double
/// exactly like the retry delays they replace. Presence updates that
/// arrive in between are counted toward the quorum.
async fn import_cube<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    config: &DraftingConfig,
    cube_id: &str,
    others_seen: &mut usize,
) -> Result<(), ConnectorError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    debug!(state = ?ConnectorState::ConfiguringImport, "importing cube {cube_id}");
    let request = encode(&Outbound::ImportCube {
        service: "Cube Cobra",
        cube_id,
        match_versions: true,
    });

    let attempts = config.import_max_attempts;
    for attempt in 0..attempts {
        if let Err(e) = sink.send(Message::Text(request.clone().into())).await {
            warn!("failed to send cube import request: {e}");
            return Err(ConnectorError::ConnectionLost);
        }
        debug!("sent cube import request for {cube_id} (attempt {})", attempt + 1);

        let window = backoff_window(config.import_base_delay_ms, attempt);
        match await_ack(stream, window, &config.bot_user, others_seen).await? {
            AckOutcome::Acked => {
                info!("cube import acknowledged for {cube_id}");
                return Ok(());
            }
            AckOutcome::TimedOut => {
                info!(
                    "cube import attempt {} of {attempts} not acknowledged within {window:?}",
                    attempt + 1
                );
            }
        }
    }

    Err(ConnectorError::ImportFailed { attempts })
}

/// Wait up to `window` for an import acknowledgment, recording presence
/// updates seen along the way.
async fn await_ack<St>(
    stream: &mut St,
    window: Duration,
    bot_user: &str,
    others_seen: &mut usize,
) -> Result<AckOutcome, ConnectorError>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let message = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(message) => message,
            Err(_) => return Ok(AckOutcome::TimedOut),
        };
        match message {
            Some(Ok(Message::Text(text))) => match parse(&text) {
                Inbound::ImportAck => return Ok(AckOutcome::Acked),
                Inbound::ImportError { error } => {
                    warn!("cube import rejected: {error}");
                    // Keep listening: the service may still ack a retry
                    // already in flight before the window closes.
                }
                Inbound::SessionUsers { users } => {
                    *others_seen = count_others(&users, bot_user);
                }
                Inbound::Unknown => {}
            },
            Some(Ok(Message::Close(_))) | None => return Err(ConnectorError::ConnectionLost),
            Some(Ok(_)) => {
                // Binary, Ping, Pong, Frame: ignored.
            }
            Some(Err(e)) => {
                warn!("websocket error during import: {e}");
                return Err(ConnectorError::ConnectionLost);
            }
        }
    }
}

/// Exponential window with up to one second of uniform jitter.
fn backoff_window(base_ms: u64, attempt: u32) -> Duration {
    let doubled = base_ms.saturating_mul(1u64 << attempt.min(20));
    let jitter = rand::thread_rng().gen_range(0..=1000);
    Duration::from_millis(doubled + jitter)
}

// ---------------------------------------------------------------------------
// Quorum wait
// ---------------------------------------------------------------------------

/// Observe presence until at least `quorum` other participants are in the
/// session, polling the roster on the configured interval. No hard
/// timeout: runs until quorum, disconnection, or task cancellation.
async fn wait_for_quorum<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    config: &DraftingConfig,
    mut others: usize,
) -> Result<(), ConnectorError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: std::fmt::Display,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    debug!(state = ?ConnectorState::WaitingForQuorum, "waiting for {} other participants", config.quorum);
    if others >= config.quorum {
        info!("quorum already present ({others} other users)");
        return Ok(());
    }

    let mut poll = tokio::time::interval(Duration::from_secs(config.presence_poll_secs.max(1)));
    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Err(e) = sink.send(Message::Text(encode(&Outbound::GetUsers).into())).await {
                    warn!("failed to request session users: {e}");
                    return Err(ConnectorError::ConnectionLost);
                }
                debug!("requested session users ({others} other users so far)");
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Inbound::SessionUsers { users } = parse(&text) {
                        others = count_others(&users, &config.bot_user);
                        info!("presence update: {others} other users in session");
                        if others >= config.quorum {
                            info!("quorum of {} reached, closing connection", config.quorum);
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(ConnectorError::ConnectionLost),
                Some(Ok(_)) => {
                    // Binary, Ping, Pong, Frame: ignored.
                }
                Some(Err(e)) => {
                    warn!("websocket error while waiting for quorum: {e}");
                    return Err(ConnectorError::ConnectionLost);
                }
            }
        }
    }
}
