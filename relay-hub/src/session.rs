//! Per-connection handler.
//!
//! A connection moves through `AWAITING_REGISTRATION -> REGISTERED -> CLOSED`.
//! The first control line must register a free, non-empty name; anything
//! else gets an `error` frame and the connection is dropped. Once
//! registered, the handler reads frames in arrival order and dispatches
//! them, while a separate writer task owns the write half and drains the
//! session's outbound queue.

use std::{io, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{DecodeError, FrameError},
    message::{ClientFrame, ServerFrame, encode_frame, read_frame, write_message},
    registry::{Outbound, Peer},
    relay::{FileHeader, RelayOutcome, relay_file},
    router::Router,
    server::RelayConfig,
};

pub const REGISTERED: &str = "registered";
pub const REGISTER_FIRST: &str = r#"register first with {"type":"register","name":"<name>"}"#;
pub const ALREADY_REGISTERED: &str = "already registered";

/// How long a closing session waits for its writer to flush queued frames.
const WRITER_GRACE: Duration = Duration::from_secs(5);

pub async fn handle_connection<R, W>(
    reader: R,
    mut writer: W,
    router: Router,
    config: Arc<RelayConfig>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);

    let Some(name) = await_registration(&mut reader, &mut writer, &config).await? else {
        close_unregistered(writer).await;
        return Ok(());
    };

    let (outbound, queue) = mpsc::channel(config.outbound_queue);
    let closed = CancellationToken::new();
    let peer = Peer::new(router.registry().next_id(), name, outbound, closed.clone());

    if let Err(err) = router.registry().register(peer.clone()).await {
        info!(name = peer.name(), "registration rejected: {err}");
        reject(&mut writer, err.to_string()).await;
        close_unregistered(writer).await;
        return Ok(());
    }
    info!(name = peer.name(), "client registered");

    // Written before the writer task starts so it always precedes anything
    // other sessions have already queued for us.
    if let Err(err) = write_message(&mut writer, &ServerFrame::ok(REGISTERED)).await {
        debug!(name = peer.name(), error = ?err, "failed to acknowledge registration");
        router.leave(&peer).await;
        return Ok(());
    }

    let writer_task = tokio::spawn(write_outbound(writer, queue, closed.clone()));
    router.announce_members().await;

    match read_loop(&mut reader, &router, &peer, &closed, &config).await {
        Ok(()) => {}
        Err(err @ FrameError::TooLong { .. }) => {
            warn!(name = peer.name(), error = %err, "dropping session");
            router.reply(&peer, ServerFrame::error(err.to_string())).await;
        }
        Err(FrameError::Io(err)) => {
            debug!(name = peer.name(), error = ?err, "session stream failed");
        }
    }

    close(&router, peer, closed, writer_task).await;
    Ok(())
}

/// Reads the mandatory first frame. Returns the registered-to-be name, or
/// `None` after reporting why the connection cannot continue.
async fn await_registration<R, W>(
    reader: &mut R,
    writer: &mut W,
    config: &RelayConfig,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let decoded = match read_frame(reader, config.max_frame_len).await {
        Ok(Some(decoded)) => decoded,
        Ok(None) => {
            debug!("connection closed before registering");
            return Ok(None);
        }
        Err(FrameError::TooLong { limit }) => {
            reject(writer, format!("control frame exceeds {limit} bytes")).await;
            return Ok(None);
        }
        Err(FrameError::Io(err)) => {
            debug!(error = ?err, "connection failed before registering");
            return Ok(None);
        }
    };

    match registration_name(decoded) {
        Ok(name) => Ok(Some(name)),
        Err(reason) => {
            reject(writer, reason).await;
            Ok(None)
        }
    }
}

fn registration_name(decoded: Result<ClientFrame, DecodeError>) -> Result<String, String> {
    match decoded {
        Ok(ClientFrame::Register { name }) if name.trim().is_empty() => {
            Err(REGISTER_FIRST.to_string())
        }
        Ok(ClientFrame::Register { name }) => Ok(name),
        Ok(_) => Err(REGISTER_FIRST.to_string()),
        Err(err) => Err(format!("invalid register frame: {err}")),
    }
}

async fn reject<W>(writer: &mut W, text: String)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = write_message(writer, &ServerFrame::error(text)).await {
        debug!(error = ?err, "failed to report registration failure");
    }
}

async fn close_unregistered<W>(mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down rejected connection");
    }
}

async fn read_loop<R>(
    reader: &mut R,
    router: &Router,
    peer: &Peer,
    closed: &CancellationToken,
    config: &RelayConfig,
) -> Result<(), FrameError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let decoded = select! {
            _ = closed.cancelled() => {
                debug!(name = peer.name(), "session cancelled");
                return Ok(());
            }
            next = read_frame(reader, config.max_frame_len) => match next? {
                Some(decoded) => decoded,
                None => return Ok(()),
            },
        };

        match decoded {
            Ok(frame) => dispatch(frame, reader, router, peer, config).await?,
            Err(err) => {
                debug!(name = peer.name(), error = %err, "undecodable frame");
                router.reply(peer, ServerFrame::error(err.to_string())).await;
            }
        }
    }
}

async fn dispatch<R>(
    frame: ClientFrame,
    reader: &mut R,
    router: &Router,
    peer: &Peer,
    config: &RelayConfig,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match frame {
        ClientFrame::Message { to, text } => router.route_message(peer, to, text).await,
        ClientFrame::File { to, filename, size } => {
            let header = FileHeader { to, filename, size };
            let outcome = relay_file(router, peer, reader, header, config).await?;
            if let RelayOutcome::Stalled { .. } = outcome {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "file body stalled",
                ));
            }
        }
        ClientFrame::List => router.list(peer).await,
        ClientFrame::Register { .. } => {
            router
                .reply(peer, ServerFrame::error(ALREADY_REGISTERED))
                .await;
        }
    }
    Ok(())
}

/// Enters `CLOSED`: leave the registry, let the writer flush, then make
/// sure it is gone.
async fn close(
    router: &Router,
    peer: Peer,
    closed: CancellationToken,
    mut writer_task: JoinHandle<io::Result<()>>,
) {
    if router.leave(&peer).await {
        info!(name = peer.name(), "client disconnected");
    }
    drop(peer);

    match timeout(WRITER_GRACE, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(error = ?err, "writer ended with error"),
        Ok(Err(err)) => warn!(error = ?err, "writer task failed"),
        Err(_) => {
            closed.cancel();
            let _ = writer_task.await;
        }
    }
}

/// Owns the write half: drains the outbound queue one item at a time so
/// frames from different senders never interleave on the wire.
async fn write_outbound<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        loop {
            let item = select! {
                _ = closed.cancelled() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            select! {
                _ = closed.cancelled() => break,
                written = write_item(&mut writer, item) => written?,
            }
        }
        Ok::<_, io::Error>(())
    }
    .await;

    if result.is_err() {
        closed.cancel();
    }
    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down session writer");
    }
    result
}

async fn write_item<W>(writer: &mut W, item: Outbound) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match item {
        Outbound::Frame(frame) => writer.write_all(&encode_frame(&frame)?).await?,
        Outbound::File { header, mut body } => {
            writer.write_all(&encode_frame(&header)?).await?;
            while let Some(chunk) = body.recv().await {
                writer.write_all(&chunk).await?;
            }
        }
    }
    writer.flush().await
}
