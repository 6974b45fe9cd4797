//! The multiplexer proper: command dispatch, subscriber fan-out, and the
//! per-FIFO reader tasks.
//!
//! Every connection gets an ordered outbound queue drained by its own
//! writer task; replies and streamed data frames never interleave within a
//! connection. The shared tables are guarded by a plain mutex whose
//! critical sections never span an await.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vmm_core::wire::{self, Frame, Tag, Timestamp};
use vmm_core::{paths, Error, Name};

use crate::ring::{ConsoleRing, DEFAULT_CAPACITY};

/// Outbound queue of one connection; cloning it is how a connection
/// becomes a subscriber.
type FrameSender = mpsc::UnboundedSender<Frame>;

#[derive(Default)]
struct Tables {
    rings: HashMap<Name, ConsoleRing>,
    subs: HashMap<Name, FrameSender>,
}

/// Console multiplexer state, shared across connection and reader tasks.
#[derive(Clone)]
pub struct Mux {
    /// Directory the per-VM FIFOs are derived from.
    dir: PathBuf,
    capacity: usize,
    tables: Arc<Mutex<Tables>>,
}

impl Mux {
    pub fn new(dir: PathBuf) -> Mux {
        Mux::with_capacity(dir, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(dir: PathBuf, capacity: usize) -> Mux {
        Mux {
            dir,
            capacity,
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    /// Accept and serve clients forever.
    pub async fn serve(&self, listener: UnixListener) -> std::io::Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let mux = self.clone();
            tokio::spawn(async move {
                mux.client_loop(stream).await;
            });
        }
    }

    async fn client_loop(&self, stream: UnixStream) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        // Writer task: a failed write ends the task and closes the queue,
        // which is how a dead subscriber is eventually noticed.
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = wire::write_frame(&mut write_half, &frame).await {
                    debug!("client write failed: {e}");
                    return;
                }
            }
        });

        loop {
            match wire::read_frame(&mut read_half).await {
                Ok(Some(frame)) => self.handle_frame(frame, &tx),
                Ok(None) => return,
                Err(Error::Decode(msg)) => {
                    let _ = tx.send(Frame::fail(Name::root(), &msg));
                }
                Err(e) => {
                    debug!("client read failed: {e}");
                    return;
                }
            }
            if tx.is_closed() {
                return;
            }
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("console tables poisoned")
    }

    fn handle_frame(&self, frame: Frame, out: &FrameSender) {
        let name = frame.header.name.clone();
        if frame.header.version != wire::WIRE_VERSION {
            let _ = out.send(Frame::fail(name, "unsupported wire version"));
            return;
        }
        match frame.header.tag {
            Tag::ConsoleAdd => self.handle_add(name, out),
            Tag::ConsoleAttach => self.handle_attach(name, out),
            Tag::ConsoleDetach => self.handle_detach(name, out),
            Tag::ConsoleHistory => self.handle_history(name, &frame.payload, out),
            _ => {
                let _ = out.send(Frame::fail(name, "unexpected command"));
            }
        }
    }

    fn handle_add(&self, name: Name, out: &FrameSender) {
        let fifo = paths::console_fifo(&self.dir, &name);
        let receiver = match open_fifo(&fifo) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("console {name}: open {} failed: {e}", fifo.display());
                let _ = out.send(Frame::fail(
                    name,
                    &format!("open {}: {e}", fifo.display()),
                ));
                return;
            }
        };
        let replaced = self
            .tables()
            .rings
            .insert(name.clone(), ConsoleRing::new(self.capacity))
            .is_some();
        if replaced {
            // Double-Add is a protocol violation by the supervisor; the old
            // ring is silently dropped rather than crashing the daemon.
            warn!("console {name}: already known, ring replaced");
        }
        self.spawn_reader(name.clone(), receiver);
        let _ = out.send(Frame::success(name, "reading"));
    }

    fn handle_attach(&self, name: Name, out: &FrameSender) {
        {
            let mut tables = self.tables();
            if !tables.rings.contains_key(&name) {
                drop(tables);
                let _ = out.send(Frame::fail(name, "not found"));
                return;
            }
            // Displaces any prior subscriber. The old queue is simply
            // forgotten; its connection notices on its next write.
            tables.subs.insert(name.clone(), out.clone());
        }
        let _ = out.send(Frame::success(name, "attached"));
    }

    fn handle_detach(&self, name: Name, out: &FrameSender) {
        self.tables().subs.remove(&name);
        let _ = out.send(Frame::success(name, "removed"));
    }

    fn handle_history(&self, name: Name, payload: &[u8], out: &FrameSender) {
        let since = match wire::decode_history_since(payload) {
            Ok(since) => since,
            Err(e) => {
                let _ = out.send(Frame::fail(name, &e.to_string()));
                return;
            }
        };
        let entries = {
            let tables = self.tables();
            tables.rings.get(&name).map(|ring| ring.read_history(since))
        };
        let Some(entries) = entries else {
            let _ = out.send(Frame::fail(name.clone(), &format!("no console for {name}")));
            return;
        };
        for (ts, line) in entries {
            let _ = out.send(Frame::data_line(name.clone(), ts, &line));
        }
        let _ = out.send(Frame::success(name, ""));
    }

    /// Read lines from the FIFO into the ring, fanning out to the
    /// subscriber if one is attached. Ring append and subscriber send
    /// happen under one lock, so they are atomic relative to the command
    /// handlers and to other VMs' readers.
    fn spawn_reader(&self, name: Name, receiver: pipe::Receiver) {
        let tables = Arc::clone(&self.tables);
        tokio::spawn(async move {
            let mut lines = BufReader::new(receiver);
            let mut buf = String::new();
            loop {
                buf.clear();
                match lines.read_line(&mut buf).await {
                    Ok(0) => {
                        debug!("console {name}: fifo closed");
                        return;
                    }
                    Ok(_) => {
                        let line = buf.trim_end_matches('\n').to_string();
                        let ts = Timestamp::now();
                        let mut tables = tables.lock().expect("console tables poisoned");
                        let Some(ring) = tables.rings.get_mut(&name) else {
                            // Ring replaced by a double-Add; this reader is
                            // the stale one.
                            return;
                        };
                        ring.write(ts, line.clone());
                        let lost = match tables.subs.get(&name) {
                            Some(sub) => {
                                sub.send(Frame::data_line(name.clone(), ts, &line)).is_err()
                            }
                            None => false,
                        };
                        if lost {
                            tables.subs.remove(&name);
                            debug!("console {name}: subscriber gone, detached");
                        }
                    }
                    Err(e) => {
                        warn!("console {name}: read failed: {e}");
                        return;
                    }
                }
            }
        });
    }
}

/// Non-blocking FIFO open. Read-write keeps a write end open on our side,
/// so the receiver neither fails before the hypervisor starts nor sees EOF
/// while it restarts (Linux semantics, like the rest of the plumbing here).
fn open_fifo(path: &Path) -> std::io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().read_write(true).open_receiver(path)
}
