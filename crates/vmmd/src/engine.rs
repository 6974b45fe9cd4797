//! Pure state transitions for the VM table.
//!
//! [`handle_command`] and [`handle_shutdown`] never perform I/O: they map
//! the current state and an input to a successor state plus an ordered
//! list of side-effect intents, which the supervisor executes. Keeping the
//! transition pure makes the two-phase create trivially rollbackable: a
//! failed phase 2 simply discards the provisional state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use vmm_core::wire::{self, CreateRequest, Frame, Tag, Timestamp, VmInfo};
use vmm_core::Name;

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

/// Static resource budgets, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Tap device names available for allocation, assumed preconfigured on
    /// the host.
    pub tap_pool: Vec<String>,
    /// Total guest memory budget in MiB.
    pub memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tap_pool: (0..10).map(|i| format!("vmmtap{i}")).collect(),
            memory_mb: 4096,
        }
    }
}

/// Bookkeeping entry for one live VM.
///
/// The child's stdout descriptor is deliberately not here: descriptors are
/// owned by the reaper task so that the state stays clonable and the fd is
/// closed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEntry {
    pub pid: u32,
    pub memory_mb: u32,
    pub cpus: u16,
    pub taps: Vec<String>,
    pub fifo: PathBuf,
}

/// The VM table plus free-resource accounting. Mutated only by the
/// supervisor committing transition results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    vms: BTreeMap<Name, VmEntry>,
    free_taps: Vec<String>,
    free_memory_mb: u32,
    pub created: u64,
    pub destroyed: u64,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> EngineState {
        EngineState {
            vms: BTreeMap::new(),
            free_taps: config.tap_pool.clone(),
            free_memory_mb: config.memory_mb,
            created: 0,
            destroyed: 0,
        }
    }

    pub fn running(&self) -> usize {
        self.vms.len()
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.vms.contains_key(name)
    }

    pub fn entry(&self, name: &Name) -> Option<&VmEntry> {
        self.vms.get(name)
    }

    pub fn free_memory_mb(&self) -> u32 {
        self.free_memory_mb
    }

    pub fn free_taps(&self) -> &[String] {
        &self.free_taps
    }
}

// ---------------------------------------------------------------------------
// Transition results
// ---------------------------------------------------------------------------

/// Side-effect intent, executed by the supervisor in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Deliver to the console helper.
    Cons(Frame),
    /// Deliver to the stats helper.
    Stat(Frame),
    /// Deliver to the log helper.
    Log(Frame),
    /// Send on the originating client connection.
    Data(Frame),
    /// Route to the client waiting on this frame's VM, if one registered.
    Waiter(Frame),
    /// Send SIGTERM to a hypervisor process.
    Kill(u32),
}

/// What the supervisor must do after applying a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Processing is complete.
    End,
    /// Register the originating client for this VM's exit notification.
    Wait(Name),
    /// A create is pending the console helper's acknowledgement; phase 2
    /// runs [`finish_create`] with this.
    Create(CreatePending),
}

/// Everything phase 1 of a create reserved and phase 2 needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePending {
    pub name: Name,
    pub request: CreateRequest,
    /// Tap names taken out of the free pool.
    pub taps: Vec<String>,
    pub fifo: PathBuf,
}

pub struct Outcome {
    pub state: EngineState,
    pub effects: Vec<Effect>,
    pub cont: Continuation,
}

/// How a hypervisor child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSummary {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitSummary::Exited(code) => write!(f, "exited with status {code}"),
            ExitSummary::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitSummary {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => ExitSummary::Exited(code),
            None => ExitSummary::Signaled(status.signal().unwrap_or(0)),
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Apply one client command to `state`. `dir` is the runtime directory the
/// console FIFO path is derived from.
pub fn handle_command(state: &EngineState, dir: &Path, frame: &Frame) -> Outcome {
    let name = frame.header.name.clone();
    if frame.header.version != wire::WIRE_VERSION {
        return reject(state, name, "unsupported wire version");
    }
    match frame.header.tag {
        Tag::Info => handle_info(state, name),
        Tag::Create => handle_create(state, dir, name, &frame.payload),
        Tag::Destroy => handle_destroy(state, name),
        Tag::Wait => handle_wait(state, name),
        _ => reject(state, name, "unexpected command"),
    }
}

fn reject(state: &EngineState, name: Name, diagnostic: &str) -> Outcome {
    Outcome {
        state: state.clone(),
        effects: vec![Effect::Data(Frame::fail(name, diagnostic))],
        cont: Continuation::End,
    }
}

fn vm_info(name: &Name, entry: &VmEntry) -> VmInfo {
    VmInfo {
        name: name.to_string(),
        pid: entry.pid,
        memory_mb: entry.memory_mb,
        cpus: entry.cpus,
        taps: entry.taps.clone(),
        fifo: entry.fifo.display().to_string(),
    }
}

fn handle_info(state: &EngineState, name: Name) -> Outcome {
    let mut effects = Vec::new();
    for (vm, entry) in state.vms.iter().filter(|(vm, _)| vm.starts_with(&name)) {
        match serde_json::to_vec(&vm_info(vm, entry)) {
            Ok(json) => effects.push(Effect::Data(Frame::new(Tag::Data, vm.clone(), json))),
            Err(e) => return reject(state, name.clone(), &format!("info encoding failed: {e}")),
        }
    }
    if effects.is_empty() && !name.is_root() {
        return reject(state, name, "not found");
    }
    effects.push(Effect::Data(Frame::success(name, "")));
    Outcome {
        state: state.clone(),
        effects,
        cont: Continuation::End,
    }
}

fn handle_create(state: &EngineState, dir: &Path, name: Name, payload: &[u8]) -> Outcome {
    if name.is_root() {
        return reject(state, name, "create requires a name");
    }
    let request = match CreateRequest::decode(payload) {
        Ok(request) => request,
        Err(e) => return reject(state, name, &e.to_string()),
    };
    if request.memory_mb == 0 || request.cpus == 0 {
        return reject(state, name, "memory and cpu reservations must be non-zero");
    }
    if state.vms.contains_key(&name) {
        let diagnostic = format!("{name} already exists");
        return reject(state, name, &diagnostic);
    }

    // Phase 1: reserve provisionally. The supervisor commits this state
    // while the console acknowledgement is outstanding and discards it if
    // the acknowledgement fails.
    let mut next = state.clone();
    if request.memory_mb > next.free_memory_mb {
        return reject(
            state,
            name,
            &format!(
                "memory budget exhausted: {} MiB requested, {} MiB free",
                request.memory_mb, next.free_memory_mb
            ),
        );
    }
    if usize::from(request.taps) > next.free_taps.len() {
        return reject(
            state,
            name,
            &format!(
                "tap pool exhausted: {} requested, {} free",
                request.taps,
                next.free_taps.len()
            ),
        );
    }
    next.free_memory_mb -= request.memory_mb;
    let taps: Vec<String> = next.free_taps.drain(..usize::from(request.taps)).collect();

    let fifo = vmm_core::paths::console_fifo(dir, &name);
    let pending = CreatePending {
        name: name.clone(),
        request,
        taps,
        fifo,
    };
    let effects = vec![
        Effect::Log(Frame::log_entry(
            name.clone(),
            Timestamp::now(),
            &format!("creating {name}"),
        )),
        Effect::Cons(Frame::console_add(name)),
    ];
    Outcome {
        state: next,
        effects,
        cont: Continuation::Create(pending),
    }
}

/// Phase 2 of create: the console helper acknowledged the Add and the
/// hypervisor is running as `pid`. `state` is the phase-1 state carrying
/// the provisional reservations.
pub fn finish_create(
    state: &EngineState,
    pending: &CreatePending,
    pid: u32,
) -> (EngineState, Vec<Effect>) {
    let mut next = state.clone();
    let entry = VmEntry {
        pid,
        memory_mb: pending.request.memory_mb,
        cpus: pending.request.cpus,
        taps: pending.taps.clone(),
        fifo: pending.fifo.clone(),
    };
    let info = vm_info(&pending.name, &entry);
    next.vms.insert(pending.name.clone(), entry);
    next.created += 1;

    let json = serde_json::to_string(&info).unwrap_or_default();
    let effects = vec![
        Effect::Stat(Frame::stat_add(pending.name.clone(), pid, &pending.taps)),
        Effect::Log(Frame::log_entry(
            pending.name.clone(),
            Timestamp::now(),
            &format!("created {} (pid {pid})", pending.name),
        )),
        Effect::Data(Frame::success(pending.name.clone(), &json)),
    ];
    (next, effects)
}

fn handle_destroy(state: &EngineState, name: Name) -> Outcome {
    let Some(entry) = state.vms.get(&name) else {
        return reject(state, name, "not found");
    };
    // Bookkeeping is deferred to the reaper so that an explicit destroy and
    // a kill by other means converge on the same path.
    let effects = vec![
        Effect::Kill(entry.pid),
        Effect::Log(Frame::log_entry(
            name.clone(),
            Timestamp::now(),
            &format!("destroying {name} (pid {})", entry.pid),
        )),
        Effect::Data(Frame::success(name, "destroyed")),
    ];
    Outcome {
        state: state.clone(),
        effects,
        cont: Continuation::End,
    }
}

fn handle_wait(state: &EngineState, name: Name) -> Outcome {
    if !state.vms.contains_key(&name) {
        return reject(state, name, "not found");
    }
    Outcome {
        state: state.clone(),
        effects: Vec::new(),
        cont: Continuation::Wait(name),
    }
}

/// Reaper path: the hypervisor child for `name` exited. Releases the VM's
/// reservations and emits the post-mortem effects.
pub fn handle_shutdown(
    state: &EngineState,
    name: &Name,
    exit: ExitSummary,
) -> (EngineState, Vec<Effect>) {
    let mut next = state.clone();
    let Some(entry) = next.vms.remove(name) else {
        // Every record has exactly one reaper outstanding, so this only
        // happens if the invariant was already broken elsewhere.
        let effects = vec![Effect::Log(Frame::log_entry(
            name.clone(),
            Timestamp::now(),
            &format!("reaped unknown vm {name}"),
        ))];
        return (next, effects);
    };
    next.free_memory_mb += entry.memory_mb;
    next.free_taps.extend(entry.taps);
    next.destroyed += 1;

    let ts = Timestamp::now();
    let line = format!("{name} {exit}");
    let effects = vec![
        Effect::Log(Frame::log_entry(name.clone(), ts, &line)),
        Effect::Stat(Frame::stat_remove(name.clone())),
        Effect::Waiter(Frame::data_line(name.clone(), ts, &line)),
        Effect::Waiter(Frame::success(name.clone(), "")),
    ];
    (next, effects)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIR: &str = "/run/vmmd-test";

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            tap_pool: vec!["tap0".into(), "tap1".into(), "tap2".into()],
            memory_mb: 256,
        }
    }

    fn request(memory_mb: u32, taps: u16) -> CreateRequest {
        CreateRequest {
            memory_mb,
            cpus: 1,
            taps,
            image: "/srv/images/hello.hvt".into(),
            args: Vec::new(),
        }
    }

    fn create_frame(vm: &str, memory_mb: u32, taps: u16) -> Frame {
        Frame::create(name(vm), &request(memory_mb, taps))
    }

    /// Drive a create through both phases against `state`.
    fn created(state: &EngineState, vm: &str, memory_mb: u32, taps: u16, pid: u32) -> EngineState {
        let outcome = handle_command(state, Path::new(DIR), &create_frame(vm, memory_mb, taps));
        let Continuation::Create(pending) = outcome.cont else {
            panic!("create was rejected: {:?}", outcome.effects);
        };
        finish_create(&outcome.state, &pending, pid).0
    }

    fn first_data(effects: &[Effect]) -> &Frame {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Data(f) => Some(f),
                _ => None,
            })
            .expect("no data effect")
    }

    #[test]
    fn create_reserves_and_requests_a_console() {
        let state = EngineState::new(&config());
        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 64, 2));

        let Continuation::Create(pending) = &outcome.cont else {
            panic!("expected a pending create");
        };
        assert_eq!(pending.taps, ["tap0", "tap1"]);
        assert_eq!(pending.fifo, PathBuf::from("/run/vmmd-test/vm.a.fifo"));
        assert_eq!(outcome.state.free_memory_mb(), 192);
        assert_eq!(outcome.state.free_taps(), ["tap2"]);
        assert!(outcome
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Cons(f) if f.header.tag == Tag::ConsoleAdd)));
    }

    #[test]
    fn failed_console_reply_leaves_state_untouched() {
        let state = EngineState::new(&config());
        let snapshot = state.clone();

        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 64, 1));
        assert!(matches!(outcome.cont, Continuation::Create(_)));
        // Rollback is just discarding the provisional state.
        drop(outcome);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn finish_create_installs_the_record() {
        let state = EngineState::new(&config());
        let next = created(&state, "vm.a", 64, 1, 4242);

        assert_eq!(next.running(), 1);
        assert_eq!(next.created, 1);
        let entry = next.entry(&name("vm.a")).unwrap();
        assert_eq!(entry.pid, 4242);
        assert_eq!(entry.taps, ["tap0"]);
    }

    #[test]
    fn finish_create_replies_with_the_record() {
        let state = EngineState::new(&config());
        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 64, 1));
        let Continuation::Create(pending) = outcome.cont else {
            panic!("expected a pending create");
        };
        let (_, effects) = finish_create(&outcome.state, &pending, 7);

        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Stat(f) if f.header.tag == Tag::StatAdd)));
        let reply = first_data(&effects);
        assert!(reply.is_success());
        let info: VmInfo =
            serde_json::from_str(&wire::decode_string(&reply.payload).unwrap()).unwrap();
        assert_eq!(info.name, "vm.a");
        assert_eq!(info.pid, 7);
    }

    #[test]
    fn memory_exhaustion_is_rejected_without_console_traffic() {
        let state = EngineState::new(&config());
        let snapshot = state.clone();
        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 512, 0));

        assert!(matches!(outcome.cont, Continuation::End));
        assert!(first_data(&outcome.effects).is_fail());
        assert!(!outcome.effects.iter().any(|e| matches!(e, Effect::Cons(_))));
        assert_eq!(outcome.state, snapshot);
    }

    #[test]
    fn tap_exhaustion_is_rejected() {
        let state = EngineState::new(&config());
        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 64, 4));
        assert!(first_data(&outcome.effects).is_fail());
        assert_eq!(outcome.state, state);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let state = created(&EngineState::new(&config()), "vm.a", 64, 0, 1);
        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 64, 0));
        assert!(first_data(&outcome.effects).is_fail());
        assert_eq!(outcome.state, state);
    }

    #[test]
    fn zero_memory_is_rejected() {
        let state = EngineState::new(&config());
        let outcome = handle_command(&state, Path::new(DIR), &create_frame("vm.a", 0, 0));
        assert!(first_data(&outcome.effects).is_fail());
    }

    #[test]
    fn destroy_emits_a_kill_and_defers_bookkeeping() {
        let state = created(&EngineState::new(&config()), "vm.a", 64, 1, 4242);
        let outcome = handle_command(&state, Path::new(DIR), &Frame::destroy(name("vm.a")));

        assert!(outcome.effects.contains(&Effect::Kill(4242)));
        // The table is untouched until the reaper fires.
        assert_eq!(outcome.state.running(), 1);
        assert_eq!(outcome.state.destroyed, 0);
    }

    #[test]
    fn destroy_unknown_fails_without_crashing() {
        let state = EngineState::new(&config());
        let outcome = handle_command(&state, Path::new(DIR), &Frame::destroy(name("ghost")));
        let reply = first_data(&outcome.effects);
        assert!(reply.is_fail());
        assert_eq!(wire::decode_string(&reply.payload).unwrap(), "not found");
    }

    #[test]
    fn shutdown_releases_reservations_and_counts() {
        let base = EngineState::new(&config());
        let state = created(&base, "vm.a", 64, 2, 4242);
        let (next, effects) = handle_shutdown(&state, &name("vm.a"), ExitSummary::Exited(0));

        assert_eq!(next.running(), 0);
        assert_eq!(next.destroyed, 1);
        assert_eq!(next.free_memory_mb(), base.free_memory_mb());
        assert_eq!(next.free_taps().len(), base.free_taps().len());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Stat(f) if f.header.tag == Tag::StatRemove)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Waiter(f) if f.is_success())));
    }

    #[test]
    fn table_size_tracks_creates_minus_reaps() {
        let mut state = EngineState::new(&config());
        state = created(&state, "vm.a", 32, 0, 1);
        state = created(&state, "vm.b", 32, 0, 2);
        state = created(&state, "vm.c", 32, 0, 3);
        assert_eq!(state.running(), 3);
        assert_eq!(state.created, 3);

        state = handle_shutdown(&state, &name("vm.b"), ExitSummary::Signaled(15)).0;
        assert_eq!(state.running(), state.created as usize - state.destroyed as usize);
        assert_eq!(state.running(), 2);
    }

    #[test]
    fn wait_registers_a_continuation() {
        let state = created(&EngineState::new(&config()), "vm.a", 64, 0, 1);
        let outcome = handle_command(&state, Path::new(DIR), &Frame::wait(name("vm.a")));
        assert_eq!(outcome.cont, Continuation::Wait(name("vm.a")));
        assert!(outcome.effects.is_empty());

        let outcome = handle_command(&state, Path::new(DIR), &Frame::wait(name("ghost")));
        assert!(first_data(&outcome.effects).is_fail());
    }

    #[test]
    fn info_matches_by_prefix() {
        let mut state = EngineState::new(&config());
        state = created(&state, "vm.a", 32, 0, 1);
        state = created(&state, "vm.b", 32, 0, 2);
        state = created(&state, "web", 32, 0, 3);

        let all = handle_command(&state, Path::new(DIR), &Frame::info(Name::root()));
        assert_eq!(all.effects.len(), 4); // three records plus the terminal reply

        let vms = handle_command(&state, Path::new(DIR), &Frame::info(name("vm")));
        assert_eq!(vms.effects.len(), 3);

        let exact = handle_command(&state, Path::new(DIR), &Frame::info(name("web")));
        let info: VmInfo = serde_json::from_slice(&first_data(&exact.effects).payload).unwrap();
        assert_eq!(info.name, "web");
        assert_eq!(info.pid, 3);
    }

    #[test]
    fn info_on_unknown_name_fails() {
        let state = EngineState::new(&config());
        let outcome = handle_command(&state, Path::new(DIR), &Frame::info(name("ghost")));
        assert!(first_data(&outcome.effects).is_fail());

        // The root query on an empty table is an empty success, not a failure.
        let outcome = handle_command(&state, Path::new(DIR), &Frame::info(Name::root()));
        assert_eq!(outcome.effects.len(), 1);
        assert!(first_data(&outcome.effects).is_success());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let state = EngineState::new(&config());
        let mut frame = Frame::info(Name::root());
        frame.header.version = 2;
        let outcome = handle_command(&state, Path::new(DIR), &frame);
        let reply = first_data(&outcome.effects);
        assert!(reply.is_fail());
        assert!(wire::decode_string(&reply.payload).unwrap().contains("version"));
    }

    #[test]
    fn console_tags_are_unexpected_here() {
        let state = EngineState::new(&config());
        let outcome = handle_command(
            &state,
            Path::new(DIR),
            &Frame::console_attach(name("vm.a")),
        );
        assert!(first_data(&outcome.effects).is_fail());
        assert!(matches!(outcome.cont, Continuation::End));
    }

    #[test]
    fn reaping_an_unknown_vm_only_logs() {
        let state = EngineState::new(&config());
        let (next, effects) = handle_shutdown(&state, &name("ghost"), ExitSummary::Exited(1));
        assert_eq!(next, state);
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], Effect::Log(_)));
    }
}
