//! Joiner output parsing.
//!
//! The joiner process talks in free-form text lines; the lifecycle only
//! cares about three marker substrings. Keeping the mapping here, as a pure
//! line → signal function, keeps the state machine testable without any
//! process plumbing.

/// Marker emitted once the joiner is in-game, followed by the server name.
const CONNECTED_MARKER: &str = "connected to: ";
/// Marker emitted when the game server rejects the connection.
const ATTEMPT_FAILED_MARKER: &str = "connection attempt failed";
/// Marker emitted when the game server announces a restart.
const RESTARTING_MARKER: &str = "server restarting";

/// A signal extracted from one line of joiner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinerSignal {
    /// In-game; carries the server name as the joiner observed it.
    Connected(String),
    /// The connection attempt was rejected.
    AttemptFailed,
    /// The server is restarting and dropped the session.
    Restarting,
}

/// Map one line of joiner output to a signal, if it contains a marker.
///
/// Matching is case-insensitive on the marker; everything else about the
/// line is ignored structurally (lines are still forwarded to the log).
pub fn parse_line(line: &str) -> Option<JoinerSignal> {
    let lowered = line.to_ascii_lowercase();

    if let Some(pos) = lowered.find(CONNECTED_MARKER) {
        let name = line[pos + CONNECTED_MARKER.len()..].trim().to_string();
        return Some(JoinerSignal::Connected(name));
    }
    if lowered.contains(ATTEMPT_FAILED_MARKER) {
        return Some(JoinerSignal::AttemptFailed);
    }
    if lowered.contains(RESTARTING_MARKER) {
        return Some(JoinerSignal::Restarting);
    }
    None
}
