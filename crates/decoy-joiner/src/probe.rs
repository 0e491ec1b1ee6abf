//! One-shot server reachability probe.
//!
//! Runs a single joiner invocation with one account, waits for a verdict
//! on the output stream, and kills the process. Used to confirm a server
//! is reachable and to learn the name it announces.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use decoy_core::{BotAccount, ServerSpec};

use crate::error::{JoinerError, JoinerResult};
use crate::output::{parse_line, JoinerSignal};

/// Probe `server` with `account`, returning the server name the joiner
/// observed.
///
/// The joiner process is killed as soon as a verdict is reached; there is
/// no reconnect. A process that exits without producing a verdict, or a
/// verdict that is not "connected", is a probe failure.
pub async fn probe_server(
    joiner_bin: &Path,
    account: &BotAccount,
    server: &ServerSpec,
    timeout: Duration,
) -> JoinerResult<String> {
    let mut cmd = Command::new(joiner_bin);
    cmd.args([
        account.username.as_str(),
        account.password.as_str(),
        server.address.as_str(),
        &server.port.to_string(),
        "",
        "-pid",
        &std::process::id().to_string(),
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(JoinerError::Spawn)?;
    let stdout = child.stdout.take();

    let verdict = match stdout {
        Some(stdout) => tokio::time::timeout(timeout, first_signal(stdout)).await,
        None => Ok(None),
    };

    // The verdict is in; the process has served its purpose.
    let _ = child.kill().await;

    match verdict {
        Ok(Some(JoinerSignal::Connected(name))) => Ok(name),
        Ok(Some(JoinerSignal::AttemptFailed)) => {
            Err(JoinerError::ProbeFailed("Connection Attempt Failed".to_string()))
        }
        Ok(Some(JoinerSignal::Restarting)) => {
            Err(JoinerError::ProbeFailed("Server Restarting".to_string()))
        }
        Ok(None) => Err(JoinerError::ProbeFailed(
            "joiner exited before reaching the server".to_string(),
        )),
        Err(_) => Err(JoinerError::ProbeTimeout(timeout.as_secs())),
    }
}

/// Read lines until one carries a signal, or the stream ends.
async fn first_signal<R>(reader: R) -> Option<JoinerSignal>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "probe output");
        if let Some(signal) = parse_line(&line) {
            return Some(signal);
        }
    }
    None
}
