//! Byte-exact file relay between two sessions.
//!
//! A `file` header is always followed by exactly `size` raw bytes on the
//! sender's stream. Whatever happens to the recipient, those bytes are
//! consumed here so the sender's next control line starts on a frame
//! boundary.

use std::{io, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    message::ServerFrame,
    registry::{Outbound, Peer},
    router::{RECIPIENT_BUSY, Router},
    server::RelayConfig,
};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_BODY_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECIPIENT_NOT_FOUND: &str = "recipient not found";

/// Chunks allowed in flight between the relay and the recipient's writer.
const BODY_WINDOW: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Complete,
    /// The recipient is unknown or busy; the body was read and dropped.
    Refused,
    /// The sender's stream ended after `relayed` bytes.
    Short { relayed: u64 },
    /// The recipient stopped accepting chunks after `relayed` bytes; the
    /// rest of the body was discarded.
    RecipientLost { relayed: u64 },
    /// The sender went quiet mid-body for longer than the body timeout. The
    /// recipient's writer is released and the sender's stream is no longer
    /// at a frame boundary.
    Stalled { relayed: u64 },
}

/// A `file` header as received from the sender.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub to: String,
    pub filename: String,
    pub size: u64,
}

/// Runs one file transfer: resolve the recipient, forward the header, then
/// stream the body. Only a failure of the sender's own stream is returned
/// as an error.
pub async fn relay_file<R>(
    router: &Router,
    sender: &Peer,
    reader: &mut R,
    header: FileHeader,
    config: &RelayConfig,
) -> io::Result<RelayOutcome>
where
    R: AsyncRead + Unpin,
{
    let FileHeader { to, filename, size } = header;

    let recipient = match to.as_str() {
        "" => None,
        name => router.registry().lookup(name).await,
    };
    let Some(recipient) = recipient else {
        return refuse(router, sender, reader, size, RECIPIENT_NOT_FOUND).await;
    };

    let (body_tx, body_rx) = mpsc::channel(BODY_WINDOW);
    let forwarded = recipient.enqueue(Outbound::File {
        header: ServerFrame::File {
            from: sender.name().to_string(),
            filename: filename.clone(),
            size,
        },
        body: body_rx,
    });
    if let Err(err) = forwarded {
        warn!(error = %err, "file header could not be delivered");
        let reason = if err.is_closed() {
            router.evict(&recipient).await;
            RECIPIENT_NOT_FOUND
        } else {
            RECIPIENT_BUSY
        };
        return refuse(router, sender, reader, size, reason).await;
    }

    let outcome = pipe_body(reader, size, config, body_tx).await?;
    match outcome {
        RelayOutcome::Refused => {}
        RelayOutcome::Complete => {
            info!(from = sender.name(), to = %to, filename = %filename, size, "relayed file");
        }
        RelayOutcome::Short { relayed } => {
            warn!(
                from = sender.name(),
                to = %to,
                filename = %filename,
                size,
                relayed,
                "sender stream ended mid-file"
            );
        }
        RelayOutcome::RecipientLost { relayed } => {
            warn!(
                from = sender.name(),
                to = %to,
                filename = %filename,
                size,
                relayed,
                "recipient dropped mid-file"
            );
            router.evict(&recipient).await;
        }
        RelayOutcome::Stalled { relayed } => {
            warn!(
                from = sender.name(),
                to = %to,
                filename = %filename,
                size,
                relayed,
                "sender stalled mid-file"
            );
        }
    }
    Ok(outcome)
}

async fn refuse<R>(
    router: &Router,
    sender: &Peer,
    reader: &mut R,
    size: u64,
    reason: &str,
) -> io::Result<RelayOutcome>
where
    R: AsyncRead + Unpin,
{
    router.reply(sender, ServerFrame::error(reason)).await;
    let drained = discard(reader, size).await?;
    debug!(from = sender.name(), drained, reason, "discarded refused file body");
    Ok(RelayOutcome::Refused)
}

/// Copies exactly `size` bytes from `reader` into `body`, at most
/// `config.chunk_size` bytes per chunk. Stops early if the reader ends or
/// sends nothing for `config.body_timeout`.
pub async fn pipe_body<R>(
    reader: &mut R,
    size: u64,
    config: &RelayConfig,
    body: mpsc::Sender<Bytes>,
) -> io::Result<RelayOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(config.chunk_size as u64);
        let mut chunk = BytesMut::with_capacity(want as usize);
        let mut limited = (&mut *reader).take(want);
        let next = limited.read_buf(&mut chunk);
        let Ok(read) = timeout(config.body_timeout, next).await else {
            return Ok(RelayOutcome::Stalled {
                relayed: size - remaining,
            });
        };
        let read = read?;
        if read == 0 {
            return Ok(RelayOutcome::Short {
                relayed: size - remaining,
            });
        }

        let relayed = size - remaining;
        remaining -= read as u64;
        if body.send(chunk.freeze()).await.is_err() {
            discard(reader, remaining).await?;
            return Ok(RelayOutcome::RecipientLost { relayed });
        }
    }
    Ok(RelayOutcome::Complete)
}

/// Reads and drops up to `size` bytes. Returns how many were consumed.
pub async fn discard<R>(reader: &mut R, size: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    tokio::io::copy(&mut (&mut *reader).take(size), &mut tokio::io::sink()).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{message::read_frame, registry::Registry};

    fn limits(chunk_size: usize) -> RelayConfig {
        RelayConfig {
            chunk_size,
            ..RelayConfig::default()
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Bytes>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn pipe_respects_chunk_ceiling_and_exact_size() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut source = payload.clone();
        source.extend_from_slice(b"trailing");
        let mut reader = &source[..];

        let (tx, rx) = mpsc::channel(1024);
        let collector = tokio::spawn(collect(rx));
        let outcome = pipe_body(&mut reader, 1000, &limits(64), tx).await.expect("pipe");
        let chunks = collector.await.expect("collector");

        assert_eq!(outcome, RelayOutcome::Complete);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 64));
        assert_eq!(chunks.concat(), payload);
        assert_eq!(reader, b"trailing");
    }

    #[tokio::test]
    async fn pipe_reports_short_transfer() {
        let mut reader = &b"abc"[..];
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(collect(rx));

        let outcome = pipe_body(&mut reader, 10, &limits(4), tx).await.expect("pipe");

        assert_eq!(outcome, RelayOutcome::Short { relayed: 3 });
        assert_eq!(collector.await.expect("collector").concat(), b"abc");
    }

    #[tokio::test]
    async fn pipe_drains_remaining_body_when_recipient_goes_away() {
        let source = [7u8; 100];
        let mut with_tail = source.to_vec();
        with_tail.extend_from_slice(b"{\"type\":\"list\"}\n");
        let mut reader = &with_tail[..];

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let outcome = pipe_body(&mut reader, 100, &limits(16), tx).await.expect("pipe");
        assert_eq!(outcome, RelayOutcome::RecipientLost { relayed: 0 });
        assert_eq!(reader, b"{\"type\":\"list\"}\n");
    }

    #[tokio::test]
    async fn quiet_sender_releases_the_body_after_timeout() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"abc").await.expect("partial body");

        let config = RelayConfig {
            chunk_size: 4,
            body_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        };
        let (tx, rx) = mpsc::channel(8);
        let collector = tokio::spawn(collect(rx));
        let mut reader = server;

        let outcome = pipe_body(&mut reader, 10, &config, tx).await.expect("pipe");

        assert_eq!(outcome, RelayOutcome::Stalled { relayed: 3 });
        assert_eq!(collector.await.expect("collector").concat(), b"abc");
        drop(client);
    }

    #[tokio::test]
    async fn busy_recipient_is_refused_but_kept() {
        let router = Router::new(Arc::new(Registry::new()));
        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        let alice = Peer::new(1, "alice".into(), alice_tx, CancellationToken::new());
        let (bob_tx, _bob_rx) = mpsc::channel(1);
        let bob = Peer::new(2, "bob".into(), bob_tx, CancellationToken::new());
        router.registry().register(alice.clone()).await.expect("alice");
        router.registry().register(bob.clone()).await.expect("bob");
        bob.deliver(ServerFrame::ok("filler")).expect("fill queue");

        let mut reader = &b"0123456789{\"type\":\"list\"}\n"[..];
        let header = FileHeader {
            to: "bob".into(),
            filename: "notes.txt".into(),
            size: 10,
        };
        let outcome = relay_file(&router, &alice, &mut reader, header, &limits(4))
            .await
            .expect("relay");

        assert_eq!(outcome, RelayOutcome::Refused);
        match alice_rx.try_recv().expect("error queued") {
            Outbound::Frame(frame) => assert_eq!(frame, ServerFrame::error(RECIPIENT_BUSY)),
            other => panic!("unexpected outbound item: {other:?}"),
        }
        assert_eq!(reader, b"{\"type\":\"list\"}\n");
        assert!(!bob.is_closed());
        assert!(router.registry().lookup("bob").await.is_some());
    }

    #[tokio::test]
    async fn unknown_recipient_gets_error_and_body_is_drained() {
        let router = Router::new(Arc::new(Registry::new()));
        let (tx, mut rx) = mpsc::channel(8);
        let alice = Peer::new(
            router.registry().next_id(),
            "alice".into(),
            tx,
            CancellationToken::new(),
        );
        router
            .registry()
            .register(alice.clone())
            .await
            .expect("register");

        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(server);
        client.write_all(b"0123456789").await.expect("body");
        client
            .write_all(b"{\"type\":\"list\"}\n")
            .await
            .expect("next frame");

        let header = FileHeader {
            to: "nobody".into(),
            filename: "notes.txt".into(),
            size: 10,
        };
        let outcome = relay_file(&router, &alice, &mut reader, header, &limits(4))
            .await
            .expect("relay");
        assert_eq!(outcome, RelayOutcome::Refused);

        match rx.try_recv().expect("error queued") {
            Outbound::Frame(frame) => assert_eq!(frame, ServerFrame::error(RECIPIENT_NOT_FOUND)),
            other => panic!("unexpected outbound item: {other:?}"),
        }

        let next = read_frame(&mut reader, 1024)
            .await
            .expect("read")
            .expect("frame present")
            .expect("decodes");
        assert_eq!(next, crate::message::ClientFrame::List);
    }

    #[tokio::test]
    async fn header_and_body_reach_recipient_as_one_item() {
        let router = Router::new(Arc::new(Registry::new()));
        let (alice_tx, _alice_rx) = mpsc::channel(8);
        let alice = Peer::new(1, "alice".into(), alice_tx, CancellationToken::new());
        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        let bob = Peer::new(2, "bob".into(), bob_tx, CancellationToken::new());
        router.registry().register(alice.clone()).await.expect("alice");
        router.registry().register(bob).await.expect("bob");

        let mut reader = &b"hello world"[..];
        let header = FileHeader {
            to: "bob".into(),
            filename: "greeting.txt".into(),
            size: 11,
        };

        let config = limits(4);
        let relay = relay_file(&router, &alice, &mut reader, header, &config);
        let receive = async {
            match bob_rx.recv().await.expect("file queued") {
                Outbound::File { header, body } => (header, collect(body).await),
                other => panic!("unexpected outbound item: {other:?}"),
            }
        };
        let (outcome, (header, chunks)) = tokio::join!(relay, receive);

        assert_eq!(outcome.expect("relay"), RelayOutcome::Complete);
        assert_eq!(
            header,
            ServerFrame::File {
                from: "alice".into(),
                filename: "greeting.txt".into(),
                size: 11
            }
        );
        assert_eq!(chunks.concat(), b"hello world");
    }
}
