//! The supervisor: owns the command socket, the helper connections, and
//! the engine state cell, and executes the engine's side-effect intents.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vmm_core::wire::{self, Frame};
use vmm_core::{paths, Error, Name, Result};

use crate::engine::{self, Continuation, CreatePending, Effect, EngineConfig, EngineState};
use crate::helper::{ConsoleChannel, HelperChannel};
use crate::spawn::{self, RunningVm, SpawnPlan};

/// Daemon configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct VmmConfig {
    /// Runtime directory holding the sockets and console FIFOs.
    pub dir: PathBuf,
    pub engine: EngineConfig,
    /// Hypervisor binary, resolved through `PATH` at spawn time.
    pub hypervisor: PathBuf,
    pub stats_interval: Duration,
}

impl Default for VmmConfig {
    fn default() -> Self {
        VmmConfig {
            dir: PathBuf::from(paths::DEFAULT_TMPDIR),
            engine: EngineConfig::default(),
            hypervisor: PathBuf::from("solo5-hvt"),
            stats_interval: Duration::from_secs(60),
        }
    }
}

type ClientSender = mpsc::UnboundedSender<Frame>;

struct Shared {
    config: VmmConfig,
    state: Mutex<EngineState>,
    console: ConsoleChannel,
    stats: HelperChannel,
    log: HelperChannel,
    /// Clients awaiting a VM's exit, keyed by name. At most one per VM;
    /// a later wait displaces an earlier one.
    waiters: StdMutex<HashMap<Name, ClientSender>>,
    started: Instant,
    shutdown: CancellationToken,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    listener: UnixListener,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Bind the command socket and connect the helper daemons. The console
    /// and log helpers are load-bearing: either one missing aborts startup.
    pub async fn start(config: VmmConfig) -> Result<Supervisor> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| Error::Resource(format!("create {}: {e}", config.dir.display())))?;

        let socket = paths::command_socket(&config.dir);
        if let Err(e) = std::fs::remove_file(&socket) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(Error::Resource(format!(
                    "remove stale {}: {e}",
                    socket.display()
                )));
            }
        }
        let listener = UnixListener::bind(&socket)
            .map_err(|e| Error::Resource(format!("bind {}: {e}", socket.display())))?;

        let shutdown = CancellationToken::new();

        let console_path = paths::console_socket(&config.dir);
        let console = ConsoleChannel::connect(&console_path, shutdown.clone())
            .await
            .map_err(|e| {
                Error::Resource(format!(
                    "console helper unavailable at {}: {e}",
                    console_path.display()
                ))
            })?;

        let log_path = paths::log_socket(&config.dir);
        let log = HelperChannel::connect("log", &log_path, Some(shutdown.clone()))
            .await
            .map_err(|e| {
                Error::Resource(format!(
                    "log helper unavailable at {}: {e}",
                    log_path.display()
                ))
            })?;

        let stats_path = paths::stats_socket(&config.dir);
        let stats = match HelperChannel::connect("stats", &stats_path, None).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    "stats helper unavailable at {}: {e}; statistics disabled",
                    stats_path.display()
                );
                HelperChannel::null("stats")
            }
        };

        info!("listening on {}", socket.display());
        let state = EngineState::new(&config.engine);
        Ok(Supervisor {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                console,
                stats,
                log,
                waiters: StdMutex::new(HashMap::new()),
                started: Instant::now(),
                shutdown,
            }),
            listener,
        })
    }

    /// Accept clients until a load-bearing helper fails.
    pub async fn run(self) -> Result<()> {
        let shared = self.shared;
        tokio::spawn(stats_reporter(Arc::clone(&shared)));
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "console or log helper channel failed",
                    )));
                }
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted.map_err(Error::Io)?;
                    let shared = Arc::clone(&shared);
                    tokio::spawn(client_loop(shared, stream));
                }
            }
        }
    }
}

/// Periodic one-line summary of the daemon's lifetime counters.
async fn stats_reporter(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.stats_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = interval.tick() => {
                let state = shared.state.lock().await;
                info!(
                    uptime_secs = shared.started.elapsed().as_secs(),
                    created = state.created,
                    destroyed = state.destroyed,
                    running = state.running(),
                    "vm summary"
                );
            }
        }
    }
}

async fn client_loop(shared: Arc<Shared>, stream: UnixStream) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

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
            Ok(Some(frame)) => handle_client_frame(&shared, frame, &tx).await,
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

/// Apply one command under the state cell and execute the outcome. The
/// cell is held across the console acknowledgement of a pending create, so
/// every transition (concurrent clients' and reapers' included) sees a
/// consistent snapshot.
async fn handle_client_frame(shared: &Arc<Shared>, frame: Frame, client: &ClientSender) {
    let mut state = shared.state.lock().await;
    let outcome = engine::handle_command(&state, &shared.config.dir, &frame);
    match outcome.cont {
        Continuation::End => {
            *state = outcome.state;
            drop(state);
            dispatch(shared, outcome.effects, client).await;
        }
        Continuation::Wait(name) => {
            *state = outcome.state;
            drop(state);
            shared
                .waiters
                .lock()
                .expect("waiter table poisoned")
                .insert(name, client.clone());
            dispatch(shared, outcome.effects, client).await;
        }
        Continuation::Create(pending) => {
            let saved = state.clone();
            *state = outcome.state;
            match drive_create(shared, &state, outcome.effects, &pending, client).await {
                Ok(next) => {
                    *state = next;
                }
                Err(e) => {
                    // Phase 1's provisional reservations are released by
                    // restoring the pre-command state.
                    *state = saved;
                    shared
                        .log
                        .send(Frame::log_entry(
                            pending.name.clone(),
                            wire::Timestamp::now(),
                            &format!("create {} failed: {e}", pending.name),
                        ))
                        .await;
                    let _ = client.send(Frame::fail(pending.name.clone(), &e.to_string()));
                }
            }
        }
    }
}

/// Phase 2 of create: console acknowledgement, hypervisor spawn, record
/// installation, reaper. `phase1` is the provisional state the caller
/// holds under the cell; the returned state is what it should commit.
async fn drive_create(
    shared: &Arc<Shared>,
    phase1: &EngineState,
    phase1_effects: Vec<Effect>,
    pending: &CreatePending,
    client: &ClientSender,
) -> Result<EngineState> {
    // The console opens the FIFO while handling the Add, so it must exist
    // before the request goes out.
    spawn::create_fifo(&pending.fifo)?;

    let mut reply = None;
    for effect in phase1_effects {
        match effect {
            Effect::Cons(frame) => reply = Some(shared.console.request(frame).await?),
            other => apply_effect(shared, other, client).await,
        }
    }
    // Success is judged on the console's reply header, not the client's
    // request header.
    match reply {
        Some(reply) if reply.is_success() => {}
        Some(reply) => {
            let diagnostic = wire::decode_string(&reply.payload)
                .unwrap_or_else(|_| "unreadable console reply".into());
            return Err(Error::Resource(format!("console: {diagnostic}")));
        }
        None => return Err(Error::Resource("create produced no console request".into())),
    }

    let plan = SpawnPlan::new(&shared.config.hypervisor, pending);
    let running = spawn::launch(&plan)?;

    let (next, effects) = engine::finish_create(phase1, pending, running.pid);
    dispatch(shared, effects, client).await;
    spawn_reaper(Arc::clone(shared), pending.name.clone(), running);
    Ok(next)
}

/// Wait for the hypervisor to exit, then apply the shutdown transition and
/// its post-mortem effects. The retained stdout descriptor is closed
/// inside [`RunningVm::reap`].
fn spawn_reaper(shared: Arc<Shared>, name: Name, running: RunningVm) {
    tokio::spawn(async move {
        let exit = running.reap().await;
        info!("{name} {exit}");

        let mut state = shared.state.lock().await;
        let (next, effects) = engine::handle_shutdown(&state, &name, exit);
        *state = next;
        drop(state);

        // Shutdown effects carry no client data; a closed throwaway queue
        // stands in for the originating connection.
        let (no_client, _) = mpsc::unbounded_channel();
        dispatch(&shared, effects, &no_client).await;
        shared
            .waiters
            .lock()
            .expect("waiter table poisoned")
            .remove(&name);
    });
}

async fn dispatch(shared: &Arc<Shared>, effects: Vec<Effect>, client: &ClientSender) {
    for effect in effects {
        apply_effect(shared, effect, client).await;
    }
}

async fn apply_effect(shared: &Arc<Shared>, effect: Effect, client: &ClientSender) {
    match effect {
        Effect::Data(frame) => {
            let _ = client.send(frame);
        }
        Effect::Cons(frame) => shared.console.send(frame).await,
        Effect::Stat(frame) => shared.stats.send(frame).await,
        Effect::Log(frame) => shared.log.send(frame).await,
        Effect::Waiter(frame) => {
            let waiter = shared
                .waiters
                .lock()
                .expect("waiter table poisoned")
                .get(&frame.header.name)
                .cloned();
            if let Some(waiter) = waiter {
                let _ = waiter.send(frame);
            }
        }
        Effect::Kill(pid) => spawn::terminate(pid),
    }
}
