//! The depot daemon: accept loop plus the per-connection request/response
//! engine.
//!
//! The server is a single-threaded, readiness-driven reactor (`depotd` builds
//! a current-thread runtime): each accepted socket gets a task whose state
//! machine cycles IDLE -> RECEIVING/SENDING -> IDLE, suspending whenever the
//! socket is not ready in the needed direction. Per-connection state is owned
//! by that task alone, so no locking exists anywhere on the request path.
//! Exactly one request is in flight per connection: the response is fully
//! written before the next header is parsed.
//!
//! Filesystem calls are synchronous `std::fs` on the reactor thread - an
//! accepted simplification; payloads move in bounded chunks so a single large
//! transfer cannot monopolize the loop between suspension points.

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::frame::{Frame, HeaderAccumulator};
use crate::listing;
use crate::protocol::{Action, Message, IO_CHUNK};
use crate::sandbox::{self, Sandbox};

/// What the dispatcher scheduled to happen after the ack is on the wire.
enum Transfer {
    None,
    /// PUT payload inbound; ends with a PUT_FIN ack.
    Receive { file: File, expected: u64 },
    /// GET/LST payload outbound.
    Send { source: PayloadSource, total: u64 },
}

/// Payload source for the SENDING phase. GET streams an open file, LST an
/// in-memory packed listing; both flow through identical chunking and
/// backpressure handling.
enum PayloadSource {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

impl Read for PayloadSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PayloadSource::File(f) => f.read(buf),
            PayloadSource::Memory(c) => std::io::Read::read(c, buf),
        }
    }
}

/// Bind and serve forever. Connection-level failures are logged and tear down
/// that connection only; a failure to accept is fatal to the whole server.
pub async fn serve(bind: &str, root: &Path) -> Result<()> {
    let sandbox = Sandbox::open(root)?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    let addr = listener.local_addr().context("local addr")?;
    info!(%addr, root = %sandbox.root().display(), "depot daemon listening");
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        let _ = stream.set_nodelay(true);
        let sandbox = sandbox.clone();
        tokio::spawn(async move {
            debug!(%peer, "client connected");
            match drive(stream, sandbox).await {
                Ok(()) => debug!(%peer, "client disconnected"),
                Err(e) => warn!(%peer, error = %e, "connection torn down"),
            }
        });
    }
}

/// Run one connection's state machine to completion.
///
/// Generic over the byte stream so tests can drive it over in-memory
/// transports with adversarial fragmentation.
pub async fn drive<S>(mut stream: S, sandbox: Sandbox) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut acc = HeaderAccumulator::new();
    let mut buf = vec![0u8; IO_CHUNK];
    // Bytes read past a phase boundary (header followed by payload in one
    // read, or payload followed by the next request). Owed to the next phase.
    let mut carry: Vec<u8> = Vec::new();

    loop {
        // IDLE: accumulate the next request header across arbitrarily
        // fragmented reads.
        let request = loop {
            if !carry.is_empty() {
                let (consumed, frame) = acc.feed(&carry).context("decode request header")?;
                carry.drain(..consumed);
                if let Some(frame) = frame {
                    break frame;
                }
                continue;
            }
            let n = stream.read(&mut buf).await.context("socket read")?;
            if n == 0 {
                if acc.is_empty() {
                    // clean shutdown between requests
                    return Ok(());
                }
                bail!("connection closed mid-header");
            }
            let (consumed, frame) = acc.feed(&buf[..n]).context("decode request header")?;
            if consumed < n {
                carry.extend_from_slice(&buf[consumed..n]);
            }
            if let Some(frame) = frame {
                break frame;
            }
        };

        debug!(action = ?request.action, path = ?request.path, "request");
        let (response, transfer) = dispatch(&sandbox, request)?;
        write_fully(&mut stream, &response.encode()).await?;

        match transfer {
            Transfer::None => {}
            Transfer::Receive { file, expected } => {
                receive_payload(&mut stream, &mut carry, file, expected).await?;
                let mut fin = response;
                fin.action = Action::PutFin;
                write_fully(&mut stream, &fin.encode()).await?;
            }
            Transfer::Send { source, total } => {
                send_payload(&mut stream, source, total).await?;
            }
        }
        stream.flush().await.context("socket flush")?;
    }
}

/// Interpret a request, mutate it into its ack, and schedule the follow-on
/// transfer. Filesystem failures surface as protocol messages; a malformed
/// request (unknown verb, missing path) is fatal to the connection.
fn dispatch(sandbox: &Sandbox, request: Frame) -> Result<(Frame, Transfer)> {
    let Some(levels) = request.path.clone() else {
        bail!("request frame without a path section");
    };
    match request.action {
        Action::Put => Ok(put_ack(sandbox, request, &levels)),
        Action::Get => Ok(get_ack(sandbox, request, &levels)),
        Action::Del => Ok(del_ack(sandbox, request, &levels)),
        Action::Lst => Ok(lst_ack(sandbox, request, &levels)),
        other => bail!("unexpected request action {:?}", other),
    }
}

fn put_ack(sandbox: &Sandbox, mut frame: Frame, levels: &[String]) -> (Frame, Transfer) {
    let mut transfer = Transfer::None;
    match sandbox.resolve(levels) {
        None => frame.message = Message::PermissionDenied,
        Some(path) => {
            if path.exists() && !frame.is_overwrite() {
                frame.message = Message::FileExist;
            } else {
                match sandbox::create_for_write(&path, frame.is_overwrite()) {
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "create failed");
                        frame.message = Message::FileNotCreated;
                    }
                    Ok(file) => {
                        frame.message = Message::FileCreated;
                        if frame.data_length > 0 {
                            transfer = Transfer::Receive {
                                file,
                                expected: frame.data_length,
                            };
                        }
                    }
                }
            }
        }
    }
    frame.action = Action::PutAck;
    (frame, transfer)
}

fn get_ack(sandbox: &Sandbox, mut frame: Frame, levels: &[String]) -> (Frame, Transfer) {
    let mut transfer = Transfer::None;
    match sandbox.resolve(levels) {
        None => frame.message = Message::PermissionDenied,
        Some(path) => {
            if !path.is_file() {
                frame.message = Message::FileNotExist;
            } else {
                match File::open(&path).and_then(|f| f.metadata().map(|md| (f, md.len()))) {
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "open failed");
                        frame.message = Message::FileNotExist;
                    }
                    Ok((file, len)) => {
                        frame.message = Message::FileExist;
                        frame.data_length = len;
                        if len > 0 {
                            transfer = Transfer::Send {
                                source: PayloadSource::File(file),
                                total: len,
                            };
                        }
                    }
                }
            }
        }
    }
    frame.action = Action::GetAck;
    (frame, transfer)
}

fn del_ack(sandbox: &Sandbox, mut frame: Frame, levels: &[String]) -> (Frame, Transfer) {
    match sandbox.resolve(levels) {
        None => frame.message = Message::PermissionDenied,
        Some(path) => {
            if !path.exists() {
                frame.message = Message::FileNotExist;
            } else {
                match sandbox::remove(&path) {
                    Ok(()) => frame.message = Message::FileDeleted,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "delete failed");
                        frame.message = Message::FileNotDeleted;
                    }
                }
            }
        }
    }
    frame.action = Action::DelAck;
    (frame, Transfer::None)
}

fn lst_ack(sandbox: &Sandbox, mut frame: Frame, levels: &[String]) -> (Frame, Transfer) {
    let mut transfer = Transfer::None;
    match sandbox.resolve(levels) {
        None => frame.message = Message::PermissionDenied,
        Some(path) => {
            if !path.exists() {
                frame.message = Message::FileNotExist;
            } else {
                frame.message = Message::FileExist;
                let files = sandbox.collect_files(&path);
                if files.is_empty() {
                    frame.data_length = 0;
                } else {
                    let blob = listing::pack(&files);
                    frame.data_length = blob.len() as u64;
                    transfer = Transfer::Send {
                        total: blob.len() as u64,
                        source: PayloadSource::Memory(Cursor::new(blob)),
                    };
                }
            }
        }
    }
    frame.action = Action::LstAck;
    (frame, transfer)
}

/// Flush an outbound span completely, re-attempting from the unwritten
/// offset whenever the socket accepts only part of it.
async fn write_fully<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut offset = 0;
    while offset < bytes.len() {
        let n = stream
            .write(&bytes[offset..])
            .await
            .context("socket write")?;
        if n == 0 {
            bail!("socket closed during write");
        }
        offset += n;
    }
    Ok(())
}

/// RECEIVING: append every payload byte verbatim to the destination file.
/// The received counter is tracked independently of physical read sizes;
/// bytes past the payload end (the peer is not supposed to pipeline, but
/// nothing stops it) go back into header accumulation via `carry`.
async fn receive_payload<S>(
    stream: &mut S,
    carry: &mut Vec<u8>,
    file: File,
    expected: u64,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut file = BufWriter::new(file);
    let mut received: u64 = 0;

    if !carry.is_empty() {
        // payload bytes that arrived in the same read as the header
        let take = (carry.len() as u64).min(expected) as usize;
        file.write_all(&carry[..take]).context("file write")?;
        received += take as u64;
        carry.drain(..take);
    }

    let mut buf = vec![0u8; IO_CHUNK];
    while received < expected {
        let n = stream.read(&mut buf).await.context("socket read")?;
        if n == 0 {
            bail!(
                "connection closed mid-payload ({} of {} bytes)",
                received,
                expected
            );
        }
        let take = ((expected - received).min(n as u64)) as usize;
        file.write_all(&buf[..take]).context("file write")?;
        received += take as u64;
        if take < n {
            carry.extend_from_slice(&buf[take..n]);
        }
    }
    file.flush().context("file flush")?;
    Ok(())
}

/// SENDING: backpressure-driven pull. A new chunk (at most [`IO_CHUNK`]
/// bytes) is taken from the source only once the previous one has fully
/// drained into the socket.
async fn send_payload<S>(stream: &mut S, mut source: PayloadSource, total: u64) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; IO_CHUNK];
    let mut sent: u64 = 0;
    while sent < total {
        let want = ((total - sent).min(IO_CHUNK as u64)) as usize;
        let n = source.read(&mut chunk[..want]).context("payload read")?;
        if n == 0 {
            bail!("payload source ran dry {} bytes early", total - sent);
        }
        write_fully(stream, &chunk[..n]).await?;
        sent += n as u64;
    }
    Ok(())
}
