//! Outbound channels to the console, stats, and log helper daemons.
//!
//! Each channel is a bounded ordered queue drained by a dedicated sender
//! task, so frames reach a helper in enqueue order even when several
//! client loops and reapers produce them concurrently. The console channel
//! additionally reads replies and routes them to pending requests by VM
//! name.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWrite;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use vmm_core::wire::{self, Frame};
use vmm_core::{Error, Name, Result};

/// Depth of each helper's outbound queue. Producers backpressure briefly
/// when a helper stalls instead of growing an unbounded mailbox.
const QUEUE_DEPTH: usize = 256;

/// Ordered queue plus persistent connection to one helper process.
pub struct HelperChannel {
    name: &'static str,
    tx: Option<mpsc::Sender<Frame>>,
}

impl HelperChannel {
    /// Connect to a helper socket and start its sender task. With `fatal`
    /// set, a write failure cancels the token and thereby the daemon.
    pub async fn connect(
        name: &'static str,
        path: &Path,
        fatal: Option<CancellationToken>,
    ) -> io::Result<HelperChannel> {
        let stream = UnixStream::connect(path).await?;
        Ok(HelperChannel::from_writer(name, stream, fatal))
    }

    /// Wrap an already-connected writer.
    pub fn from_writer<W>(
        name: &'static str,
        mut writer: W,
        fatal: Option<CancellationToken>,
    ) -> HelperChannel
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Frame>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = wire::write_frame(&mut writer, &frame).await {
                    error!("{name} helper write failed: {e}");
                    if let Some(token) = fatal {
                        token.cancel();
                    }
                    return;
                }
            }
        });
        HelperChannel {
            name,
            tx: Some(tx),
        }
    }

    /// A channel that silently drops everything, standing in for a missing
    /// optional helper.
    pub fn null(name: &'static str) -> HelperChannel {
        HelperChannel { name, tx: None }
    }

    /// Enqueue a frame. Frames to a torn-down channel are dropped; for
    /// essential helpers the teardown has already flagged the daemon fatal.
    pub async fn send(&self, frame: Frame) {
        let Some(tx) = &self.tx else {
            trace!("{} helper absent, frame dropped", self.name);
            return;
        };
        if tx.send(frame).await.is_err() {
            debug!("{} helper queue closed, frame dropped", self.name);
        }
    }
}

/// The console connection: an ordered outbound queue plus a router that
/// matches replies to pending requests by VM name.
pub struct ConsoleChannel {
    channel: HelperChannel,
    pending: Arc<Mutex<HashMap<Name, oneshot::Sender<Frame>>>>,
    fatal: CancellationToken,
}

impl ConsoleChannel {
    pub async fn connect(path: &Path, fatal: CancellationToken) -> io::Result<ConsoleChannel> {
        let stream = UnixStream::connect(path).await?;
        Ok(ConsoleChannel::from_stream(stream, fatal))
    }

    pub fn from_stream(stream: UnixStream, fatal: CancellationToken) -> ConsoleChannel {
        let (mut read_half, write_half) = stream.into_split();
        let channel = HelperChannel::from_writer("console", write_half, Some(fatal.clone()));
        let pending: Arc<Mutex<HashMap<Name, oneshot::Sender<Frame>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let fatal_for_requests = fatal.clone();

        let router = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                match wire::read_frame(&mut read_half).await {
                    Ok(Some(frame)) if frame.is_reply() => {
                        let waiter = router
                            .lock()
                            .expect("console pending table poisoned")
                            .remove(&frame.header.name);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                            None => debug!(
                                "unmatched console reply for {}, dropped",
                                frame.header.name
                            ),
                        }
                    }
                    Ok(Some(frame)) => {
                        debug!("unexpected console frame {:?}, dropped", frame.header.tag);
                    }
                    Ok(None) => {
                        error!("console helper closed its connection");
                        router.lock().expect("console pending table poisoned").clear();
                        fatal.cancel();
                        return;
                    }
                    Err(e) => {
                        error!("console helper read failed: {e}");
                        router.lock().expect("console pending table poisoned").clear();
                        fatal.cancel();
                        return;
                    }
                }
            }
        });

        ConsoleChannel {
            channel,
            pending,
            fatal: fatal_for_requests,
        }
    }

    /// Send a frame and await the console's reply for the same VM. Fails
    /// once the connection is flagged fatal, so a dead console never
    /// strands a pending create.
    pub async fn request(&self, frame: Frame) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("console pending table poisoned")
            .insert(frame.header.name.clone(), tx);
        self.channel.send(frame).await;
        let lost = || {
            Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "console helper connection lost",
            ))
        };
        tokio::select! {
            reply = rx => reply.map_err(|_| lost()),
            _ = self.fatal.cancelled() => Err(lost()),
        }
    }

    /// Fire-and-forget delivery, for effects that expect no reply.
    pub async fn send(&self, frame: Frame) {
        self.channel.send(frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::UnixListener;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn frames_are_delivered_in_enqueue_order() {
        let (client, mut server) = tokio::io::duplex(4096);
        let channel = HelperChannel::from_writer("test", client, None);

        for i in 0..5 {
            channel.send(Frame::success(name("vm"), &format!("m{i}"))).await;
        }

        for i in 0..5 {
            let frame = wire::read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(
                wire::decode_string(&frame.payload).unwrap(),
                format!("m{i}")
            );
        }
    }

    #[tokio::test]
    async fn null_channel_drops_silently() {
        let channel = HelperChannel::null("stats");
        channel.send(Frame::stat_remove(name("vm"))).await;
    }

    #[tokio::test]
    async fn write_failure_cancels_the_fatal_token() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let token = CancellationToken::new();
        let channel = HelperChannel::from_writer("log", client, Some(token.clone()));

        channel.send(Frame::success(name("vm"), "x")).await;

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("fatal token was never cancelled");
    }

    #[tokio::test]
    async fn console_request_routes_the_reply() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("cons.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        // Fake console helper: acknowledge every Add.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(frame)) = wire::read_frame(&mut stream).await {
                let reply = Frame::success(frame.header.name, "reading");
                wire::write_frame(&mut stream, &reply).await.unwrap();
            }
        });

        let token = CancellationToken::new();
        let console = ConsoleChannel::connect(&sock, token).await.unwrap();
        let reply = console
            .request(Frame::console_add(name("vm.a")))
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.header.name, name("vm.a"));
    }

    #[tokio::test]
    async fn console_disconnect_fails_pending_requests_and_turns_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("cons.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        // Helper accepts, reads one frame, then drops the connection.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = wire::read_frame(&mut stream).await;
        });

        let token = CancellationToken::new();
        let console = ConsoleChannel::connect(&sock, token.clone()).await.unwrap();
        let result = console.request(Frame::console_add(name("vm.a"))).await;
        assert!(result.is_err());
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("fatal token was never cancelled");
    }
}
