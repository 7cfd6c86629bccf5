//! [`ProcessBus`]: a [`Bus`] wired with the fixed state graph and built-in
//! plugins a whole process's lifecycle needs (§4.6).
//!
//! ```text
//!      XXXXXXXXXXXXXXXX START              XXXXXX-> EXIT_ERROR
//!      |              /   |   A            X            |
//!      V             V    |    \           X            V
//! START_ERROR <-XX RUN    |    IDLE ----> EXIT ----> EXITED ---> X
//!      |             \    |    A| A
//!      |              V   V   / |  \
//!      +---------------> STOP   X    ENTER <--- INITIAL
//!                         X     X      X
//!                         |     |      X
//!                         V     V      X
//!                        STOP_ERROR <-XX
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bus::Bus;
use crate::channel::ChannelId;
use crate::error::{BusError, ListenerError, LogLevel, Payload};
use crate::graph::edge_map;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code used when a listener on the `EXIT` channel itself fails —
/// `EX_SOFTWARE` in the BSD `sysexits.h` sense, matching the reference
/// implementation's `os._exit(70)`.
const EX_SOFTWARE: i32 = 70;

fn process_bus_transitions() -> crate::graph::EdgeMap {
    edge_map(&[
        ("INITIAL", &["ENTER"]),
        ("ENTER", &["IDLE"]),
        ("START", &["RUN", "STOP"]),
        ("RUN", &["STOP"]),
        ("START_ERROR", &["STOP"]),
        ("STOP", &["IDLE"]),
        ("IDLE", &["START", "EXIT"]),
        ("STOP_ERROR", &["EXIT"]),
        ("EXIT", &["EXITED"]),
        ("EXIT_ERROR", &["EXITED"]),
    ])
}

/// A [`Bus`] dedicated to modeling one process's lifecycle, with the fixed
/// transition/error graph and built-in listeners a server process needs
/// (§4.6): logging and exiting cleanly on a start/stop error, exiting hard
/// on an error in the exit handler itself, waiting for worker threads to
/// finish before the process actually goes away, and warning (then forcing
/// a shutdown) if the process exits without ever reaching `EXITED`.
pub struct ProcessBus {
    bus: Arc<Bus>,
    startup_cwd: PathBuf,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::ops::Deref for ProcessBus {
    type Target = Bus;

    fn deref(&self) -> &Bus {
        &self.bus
    }
}

impl ProcessBus {
    /// Build a `ProcessBus` with the reference implementation's fixed
    /// transition and error graph, plus its `START_ERROR`/`STOP_ERROR`/
    /// `EXIT_ERROR`/thread-join listeners already installed.
    pub fn new() -> Self {
        let bus = Arc::new(
            Bus::builder()
                .transitions(process_bus_transitions())
                .error("ENTER", "STOP_ERROR")
                .error("START", "START_ERROR")
                .error("RUN", "START_ERROR")
                .error("STOP", "STOP_ERROR")
                .error("IDLE", "STOP_ERROR")
                .error("EXIT", "EXIT_ERROR")
                .initial_state("INITIAL")
                .extra_channel("main")
                .extra_channel("execv")
                .build(),
        );

        let threads: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        {
            let b = bus.clone();
            bus.subscribe(
                "START_ERROR",
                "process::start-error",
                None,
                move |_: &Payload| -> Result<(), ListenerError> {
                    b.log_message(
                        "Exiting due to error in start listener",
                        LogLevel::Error,
                    );
                    let _ = b.transition("EXITED");
                    Ok(())
                },
            );
        }
        {
            let b = bus.clone();
            bus.subscribe(
                "STOP_ERROR",
                "process::stop-error",
                None,
                move |_: &Payload| -> Result<(), ListenerError> {
                    b.log_message("Exiting due to error in stop listener", LogLevel::Error);
                    let _ = b.transition("EXITED");
                    Ok(())
                },
            );
        }
        {
            let b = bus.clone();
            bus.subscribe(
                "EXIT_ERROR",
                "process::exit-error",
                None,
                move |_: &Payload| -> Result<(), ListenerError> {
                    // Called asynchronously by nature (whatever thread was
                    // running `exit`'s listeners when one of them failed),
                    // so there's no well-defined caller left to propagate
                    // an error to. Log it and die.
                    b.log_message("Exiting due to error in 'exit' listener", LogLevel::Error);
                    std::process::exit(EX_SOFTWARE);
                },
            );
        }
        {
            let b = bus.clone();
            let threads = threads.clone();
            bus.subscribe(
                "EXIT",
                "process::thread-wait",
                Some(100),
                move |_: &Payload| -> Result<(), ListenerError> {
                    b.log_message("Waiting for child threads to terminate...", LogLevel::Info);
                    let mut guard = threads.lock().unwrap_or_else(|e| e.into_inner());
                    for handle in guard.drain(..) {
                        let _ = handle.join();
                    }
                    Ok(())
                },
            );
        }

        ProcessBus {
            bus,
            startup_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            threads,
        }
    }

    /// Restart the process (§4.6, §9). Does not call `execv` from the
    /// calling thread; it registers a one-shot listener on the `execv`
    /// channel and transitions to `EXITED`. [`ProcessBus::block`] (expected
    /// to run on the main thread, per platform constraints on `execv`)
    /// publishes to `execv` once it observes `EXITED`, which is what
    /// actually replaces the process image.
    pub fn restart(&self) {
        let cwd = self.startup_cwd.clone();
        let b = self.bus.clone();
        self.bus.subscribe(
            "execv",
            "process::execv",
            Some(100),
            move |_: &Payload| -> Result<(), ListenerError> {
                match reexec(&cwd, &b) {
                    Ok(never) => match never {},
                    Err(e) => Err(ListenerError::Fatal(Box::new(e))),
                }
            },
        );
        let _ = self.bus.transition("EXITED");
    }

    /// Move to `IDLE`, then back to `RUN` (§4.6).
    pub fn graceful(&self) -> Result<(), BusError> {
        self.bus.transition("IDLE")?;
        self.bus.transition("RUN")?;
        Ok(())
    }

    /// Wait for `EXITED`. Intended to be called only by the main thread:
    /// once `EXITED` is reached (and the `EXIT`-channel thread-join
    /// listener has rejoined every worker thread), it publishes to `execv`,
    /// which fires the one-shot listener `restart` installed, if any (§4.6).
    pub fn block(&self, interval: Duration, sleep: bool) -> Result<(), BusError> {
        let main = ChannelId::new("main");
        let targets = [ChannelId::new("EXITED")];
        if let Err(err) = self.bus.wait(&targets, interval, Some(&main), sleep) {
            self.bus
                .log_message("Shutting down bus after wait error", LogLevel::Error);
            let _ = self.bus.transition("EXITED");
            if matches!(err, BusError::Fatal(_)) {
                return Err(err);
            }
        }
        self.bus.publish("execv", &Payload::None)?;
        Ok(())
    }

    /// Start `func` in a new thread, which first waits for `RUN`, then
    /// transitions the bus to `RUN` itself from the calling thread. The
    /// thread is handed to the bus's own registry (joined by the built-in
    /// `EXIT`-channel listener) rather than returned — unlike the reference
    /// implementation's `Thread` object, a `JoinHandle` can't be owned by
    /// both the caller and the bus's shutdown machinery at once, and
    /// `bus.wait(&[RUN], ..)` gives an equivalent way to observe it start.
    pub fn start_with_callback<F>(&self, func: F) -> Result<(), BusError>
    where
        F: FnOnce() + Send + 'static,
    {
        let bus = self.bus.clone();
        let handle = std::thread::Builder::new()
            .name("bus-callback".into())
            .spawn(move || {
                if bus
                    .wait(&[ChannelId::new("RUN")], DEFAULT_INTERVAL, None, false)
                    .is_ok()
                {
                    func();
                }
            })
            .expect("failed to spawn callback thread");

        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        self.bus.transition("RUN")?;
        Ok(())
    }
}

impl Default for ProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A clean-exit check substituting for the reference implementation's
/// `atexit`-registered `CleanExit` plugin: Rust has no equivalent global
/// exit hook a library can hang a callback off, but every `ProcessBus` is
/// expected to live exactly as long as the process, so `Drop` fires at
/// essentially the same moment. If the process is being dropped (and so,
/// ordinarily, about to exit) without ever reaching `EXITED`, force the
/// transition so any `EXIT`/`EXITED` listeners (log flushing, thread joins)
/// still run once.
impl Drop for ProcessBus {
    fn drop(&mut self) {
        if self.bus.state() != ChannelId::new("EXITED") {
            self.bus.log_message(
                &format!(
                    "ProcessBus dropped while in the {:?} state; shutting it down now",
                    self.bus.state()
                ),
                LogLevel::Warning,
            );
            let _ = self.bus.transition("EXITED");
        }
    }
}

#[cfg(unix)]
fn reexec(cwd: &std::path::Path, bus: &Bus) -> std::io::Result<std::convert::Infallible> {
    use std::ffi::CString;

    let argv: Vec<String> = std::env::args().collect();
    bus.log_message(&format!("Re-spawning {}", argv.join(" ")), LogLevel::Info);

    if let Err(e) = std::env::set_current_dir(cwd) {
        bus.log_message(
            &format!("Could not restore startup directory before re-exec: {e}"),
            LogLevel::Warning,
        );
    }

    set_cloexec_on_open_files();

    let cargs: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).unwrap_or_else(|_| CString::new("").unwrap()))
        .collect();
    let program = cargs
        .first()
        .cloned()
        .unwrap_or_else(|| CString::new("").unwrap());

    match nix::unistd::execvp(&program, &cargs) {
        Ok(infallible) => match infallible {},
        Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(not(unix))]
fn reexec(_cwd: &std::path::Path, bus: &Bus) -> std::io::Result<std::convert::Infallible> {
    bus.log_message(
        "Re-exec is only supported on unix platforms",
        LogLevel::Error,
    );
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "execv is not available on this platform",
    ))
}

/// Best-effort close-on-exec sweep over file descriptors above stderr, so a
/// restarted process doesn't inherit file descriptors the old one opened.
/// Mirrors the reference implementation's `_set_cloexec`, with the same
/// fixed fallback limit when the platform can't report its actual open-file
/// ceiling.
#[cfg(unix)]
fn set_cloexec_on_open_files() {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::RawFd;

    const FALLBACK_MAX_FILES: RawFd = 1024;

    for fd in 3..FALLBACK_MAX_FILES {
        if let Ok(raw_flags) = fcntl(fd, FcntlArg::F_GETFD) {
            let flags = FdFlag::from_bits_truncate(raw_flags) | FdFlag::FD_CLOEXEC;
            let _ = fcntl(fd, FcntlArg::F_SETFD(flags));
        }
    }
}
