// Per-connection protocol: handshake, heartbeat while accepting, upload while collecting.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::metrics;

use super::codes::ControlCode;
use super::registry::ConnectionId;
use super::{ProtocolError, SessionEvent, SessionShared, SessionState, Writer};

/// Longest accepted name line, excluding the terminator.
pub const MAX_NAME_LEN: usize = 64;

/// Write one control byte.
pub(crate) async fn write_code(writer: &Writer, code: ControlCode) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    w.write_all(&[code.byte()]).await?;
    w.flush().await
}

/// Read the `\n`-terminated name line a client sends on connect.
pub async fn read_name<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_NAME_LEN as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 || buf.last() != Some(&b'\n') {
        return Err(ProtocolError::MalformedHandshake("name line not terminated".into()));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let name = String::from_utf8(buf)
        .map_err(|_| ProtocolError::MalformedHandshake("name is not valid UTF-8".into()))?;
    if name.trim().is_empty() {
        return Err(ProtocolError::MalformedHandshake("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::MalformedHandshake("name too long".into()));
    }
    Ok(name)
}

/// Resolve once the session has reached at least `target`.
async fn reached(rx: &mut watch::Receiver<SessionState>, target: SessionState) {
    loop {
        let current = *rx.borrow_and_update();
        if current >= target {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Writes a heartbeat every `interval`. Returns only when a write fails.
async fn heartbeat(writer: Writer, id: ConnectionId, interval: Duration) -> std::io::Error {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = write_code(&writer, ControlCode::Heartbeat).await {
            return e;
        }
        tracing::debug!(connection = id, "Heartbeat sent");
    }
}

/// Drive one accepted stream through the whole session lifecycle.
pub(crate) async fn handle_connection(shared: Arc<SessionShared>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut state_rx = shared.state_tx.subscribe();

    let name = tokio::select! {
        res = read_name(&mut reader) => match res {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(peer = ?peer, "Handshake rejected: {e}");
                metrics::CONNECTIONS_REJECTED_TOTAL.with_label_values(&["malformed"]).inc();
                return;
            }
        },
        _ = reached(&mut state_rx, SessionState::Closed) => return,
    };

    let registered = shared.registry.lock().unwrap().register_name(&name);
    let id = match registered {
        Ok(id) => id,
        Err(e) => {
            tracing::info!(peer = ?peer, "Handshake rejected: {e}");
            metrics::CONNECTIONS_REJECTED_TOTAL.with_label_values(&["duplicate_name"]).inc();
            let _ = write_code(&writer, ControlCode::Disconnect).await;
            let _ = writer.lock().await.shutdown().await;
            return;
        }
    };
    shared.writers.lock().unwrap().insert(id, writer.clone());
    metrics::CONNECTIONS_ACCEPTED_TOTAL.inc();
    metrics::LIVE_CONNECTIONS.inc();
    tracing::info!(connection = id, name = %name, peer = ?peer, "Participant connected");
    shared.emit(SessionEvent::Connected { id, name: name.clone() });

    // Accepting: heartbeat until the host moves on or the peer goes away.
    if *state_rx.borrow_and_update() == SessionState::Accepting {
        let mut beat = tokio::spawn(heartbeat(writer.clone(), id, shared.config.heartbeat));
        let lost = tokio::select! {
            res = &mut beat => Some(match res {
                Ok(e) => e.to_string(),
                Err(e) => e.to_string(),
            }),
            _ = reached(&mut state_rx, SessionState::Collecting) => None,
        };
        if let Some(reason) = lost {
            shared.connection_lost(id, &reason);
            return;
        }
        // No heartbeat may follow the NEXT_SCREEN below.
        beat.abort();
        let _ = beat.await;
    }

    if *state_rx.borrow_and_update() == SessionState::Collecting {
        if let Err(e) = write_code(&writer, ControlCode::NextScreen).await {
            shared.connection_lost(id, &e.to_string());
            return;
        }
        collect(&shared, id, &mut reader, &mut state_rx).await;
    }

    // Closed: say goodbye and forget the connection.
    reached(&mut state_rx, SessionState::Closed).await;
    let _ = write_code(&writer, ControlCode::NextScreen).await;
    let _ = writer.lock().await.shutdown().await;
    shared.release(id);
    tracing::debug!(connection = id, "Connection closed with session");
}

/// Read uploads until the session closes. Each `SUBMISSION_FINISHED` byte
/// completes one upload; a later upload replaces the earlier one.
async fn collect(
    shared: &SessionShared,
    id: ConnectionId,
    reader: &mut BufReader<OwnedReadHalf>,
    state_rx: &mut watch::Receiver<SessionState>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let finished = ControlCode::SubmissionFinished.byte();

    loop {
        tokio::select! {
            res = reader.read(&mut chunk) => match res {
                Ok(0) => {
                    tracing::info!(connection = id, "Participant stopped sending");
                    shared.registry.lock().unwrap().mark_dead(id);
                    return;
                }
                Ok(n) => {
                    for &b in &chunk[..n] {
                        if b == finished {
                            let source = String::from_utf8_lossy(&pending).into_owned();
                            pending.clear();
                            shared.submit(id, source);
                        } else {
                            pending.push(b);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(connection = id, "Read failed while collecting: {e}");
                    shared.registry.lock().unwrap().mark_dead(id);
                    return;
                }
            },
            _ = reached(state_rx, SessionState::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn name_of(input: &[u8]) -> Result<String, ProtocolError> {
        let mut reader = BufReader::new(input);
        read_name(&mut reader).await
    }

    #[tokio::test]
    async fn test_read_name() {
        assert_eq!(name_of(b"alice\n").await.unwrap(), "alice");
        assert_eq!(name_of(b"bob\r\nextra").await.unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_read_name_malformed() {
        let inputs: [&[u8]; 5] = [b"", b"\n", b"  \r\n", b"no-newline", b"\xff\xfe\n"];
        for input in inputs {
            assert!(
                matches!(name_of(input).await, Err(ProtocolError::MalformedHandshake(_))),
                "input {input:?}"
            );
        }
        let long = format!("{}\n", "x".repeat(MAX_NAME_LEN + 1));
        assert!(name_of(long.as_bytes()).await.is_err());
    }
}
