//! Lifecycle management for spawned provisioning commands
//!
//! Every external command runs in its own process group with a parent-death
//! signal, and its PID is tracked in a global registry.
//!
//! A termination signal during an installation does not kill anything: it
//! raises the interrupt flag of every registered run, the running command
//! finishes, and the run stops at the next stage boundary and unmounts its
//! root. A second signal, or a signal while no run is registered, terminates
//! whatever is still in flight and exits.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Running child processes, keyed by PID, with the command line for logging.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<u32, String>,
    shutting_down: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32, command: &str) {
        self.children.insert(pid, command.to_string());
        log::debug!("Tracking child PID {} ({})", pid, command);
    }

    pub fn unregister(&mut self, pid: u32) {
        if self.children.remove(&pid).is_some() {
            log::debug!("Child PID {} finished", pid);
        }
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    /// Whether a shutdown has started; new commands should not be spawned.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Terminate every tracked process group: SIGTERM, then SIGKILL after
    /// `grace_period`. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        if self.children.is_empty() {
            return;
        }

        log::warn!("Terminating {} running command(s)", self.children.len());
        for (pid, command) in self.children.drain() {
            log::warn!("Stopping PID {} ({})", pid, command);
            terminate_group(pid, grace_period);
        }
    }
}

/// Register a spawned child in the global registry.
pub fn track(pid: u32, command: &str) {
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid, command);
    }
}

/// Remove a finished child from the global registry.
pub fn untrack(pid: u32) {
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }
}

/// True once a termination signal has been handled.
pub fn is_shutting_down() -> bool {
    ChildRegistry::global()
        .lock()
        .map(|registry| registry.is_shutting_down())
        .unwrap_or(true)
}

/// SIGTERM a process group, escalating to SIGKILL if any member outlives
/// `grace_period`. Members are addressed through the group, so this also
/// works after the leader has exited.
pub fn terminate_group(pgid: u32, grace_period: Duration) {
    if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
        log::debug!("SIGTERM to process group {} failed: {}", pgid, e);
        return;
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        if !is_group_alive(pgid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    if is_group_alive(pgid) {
        log::warn!("Process group {} outlived SIGTERM, sending SIGKILL", pgid);
        if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
            log::debug!("SIGKILL to process group {} failed: {}", pgid, e);
        }
    }
}

/// Negative PID addresses the whole group, so grandchildren are reached too.
fn signal_group(pgid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), sig)
}

/// State letter and process group from `/proc/<pid>/stat`.
fn proc_stat(pid: u32) -> Option<(String, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces; fields after it are fixed
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.to_string();
    let pgrp = fields.nth(1)?.parse().ok()?;
    Some((state, pgrp))
}

fn is_zombie(state: &str) -> bool {
    matches!(state, "Z" | "X")
}

/// True if the process exists and is not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    proc_stat(pid).map_or(true, |(state, _)| !is_zombie(&state))
}

/// True while any non-zombie process remains in group `pgid`.
pub fn is_group_alive(pgid: u32) -> bool {
    if signal::kill(Pid::from_raw(-(pgid as i32)), None).is_err() {
        return false;
    }
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return true;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(proc_stat)
        .any(|(state, pgrp)| pgrp == pgid && !is_zombie(&state))
}

// ============================================================================
// Interrupts
// ============================================================================

fn interrupt_hooks() -> &'static Mutex<HashMap<u64, Arc<AtomicBool>>> {
    static HOOKS: OnceLock<Mutex<HashMap<u64, Arc<AtomicBool>>>> = OnceLock::new();
    HOOKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A run that wants termination signals delivered as a flag instead of a
/// kill. Unregisters on drop.
#[derive(Debug)]
pub struct InterruptHook {
    id: u64,
}

impl InterruptHook {
    pub fn register(flag: Arc<AtomicBool>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let mut hooks = interrupt_hooks()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks.insert(id, flag);
        Self { id }
    }
}

impl Drop for InterruptHook {
    fn drop(&mut self) {
        let mut hooks = interrupt_hooks()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks.remove(&self.id);
    }
}

/// Raise the flag of every registered run. False if none is registered.
pub fn interrupt_runs() -> bool {
    let hooks = interrupt_hooks()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for flag in hooks.values() {
        flag.store(true, Ordering::SeqCst);
    }
    !hooks.is_empty()
}

/// Install SIGINT/SIGTERM/SIGHUP handlers. Call once at program start.
///
/// The first signal during an installation interrupts the run at its next
/// stage boundary. Otherwise all tracked commands are stopped and the
/// process exits.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        let mut deferred = false;
        for sig in signals.forever() {
            if !deferred && interrupt_runs() {
                deferred = true;
                log::warn!(
                    "Received signal {}, stopping after the running command (repeat to force)",
                    sig
                );
                continue;
            }
            log::warn!("Received signal {}, stopping running commands", sig);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command` to isolate children
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that receives
    /// SIGTERM if the installer dies.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls (setpgid, prctl) run between
        // fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::from)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_registry_register_unregister() {
        let mut registry = ChildRegistry::default();
        registry.register(1234, "sleep 1");
        registry.register(5678, "sleep 2");
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.is_shutting_down());

        registry.register(999_999, "fake");
        registry.terminate_all(Duration::from_millis(10));
        // Second call is a no-op, so the fake entry stays
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_group_stops_real_process() {
        let mut child = Command::new("sleep")
            .arg("30")
            .in_new_process_group()
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();

        terminate_group(pid, Duration::from_millis(500));
        let status = child.wait().expect("wait for sleep");
        assert!(!status.success());
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
        assert!(!is_group_alive(999_999));
    }

    #[test]
    fn test_terminate_group_kills_members_ignoring_sigterm() {
        // The leader dies on SIGTERM; the background member ignores it
        let mut child = Command::new("sh")
            .args(["-c", "(trap '' TERM; sleep 30) & sleep 30"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sh");
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        terminate_group(pid, Duration::from_millis(300));
        let _ = child.wait();

        let deadline = Instant::now() + Duration::from_secs(5);
        while is_group_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!is_group_alive(pid));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_interrupt_hook_raises_flag_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));
        let hook = InterruptHook::register(flag.clone());
        assert!(interrupt_runs());
        assert!(flag.load(Ordering::SeqCst));

        drop(hook);
        flag.store(false, Ordering::SeqCst);
        interrupt_runs();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
