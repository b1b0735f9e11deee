//! Supervises a whole-device copy.
//!
//! [`Orchestrator::execute`] checks the compound guard (an approved plan *and*
//! a non-empty confirmation, plus elevated privileges) before anything is
//! launched, then hands the copy tool to a worker thread. The caller gets a
//! [`CloneSession`]: a forward-only stream of [`CloneEvent`]s that carries the
//! tool's output line by line and ends with exactly one
//! [`CloneEvent::Finished`].
//!
//! An orchestrator runs one clone at a time. While a clone is in flight every
//! other `execute` call is refused with [`Error::AlreadyInProgress`], whatever
//! its destination.

use crate::error::{Error, Result};
use crate::validate::{ClonePlan, ConfirmationToken};
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 4 MiB, a good default for device-to-device copies.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An external program able to copy one raw device onto another.
pub trait CopyTool: Send + Sync {
    /// Builds the command that copies `source` onto `destination`.
    ///
    /// With a `limit`, the command must stop after that many bytes and exit
    /// successfully.
    fn command(
        &self,
        source: &Path,
        destination: &Path,
        block_size: u64,
        limit: Option<u64>,
    ) -> Command;
}

/// `dd`, reporting progress with `status=progress`.
#[derive(Clone, Debug)]
pub struct DdTool {
    program: PathBuf,
}

impl DdTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for DdTool {
    fn default() -> Self {
        Self::new("dd")
    }
}

impl CopyTool for DdTool {
    fn command(
        &self,
        source: &Path,
        destination: &Path,
        block_size: u64,
        limit: Option<u64>,
    ) -> Command {
        let mut input = OsString::from("if=");
        input.push(source);
        let mut output = OsString::from("of=");
        output.push(destination);

        let mut cmd = Command::new(&self.program);
        cmd.arg(input).arg(output);
        match limit {
            // dd counts whole blocks, so shrink the block until it divides the limit.
            Some(limit) => {
                let bs = gcd(block_size, limit);
                if bs != block_size {
                    debug!("Using {bs}-byte blocks to stop at exactly {limit} bytes");
                }
                cmd.arg(format!("bs={bs}"))
                    .arg(format!("count={}", limit / bs));
            }
            None => {
                cmd.arg(format!("bs={block_size}"));
            }
        }
        cmd.arg("conv=fsync").arg("status=progress");
        cmd
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloneOptions {
    /// Block size handed to the copy tool, in bytes.
    pub block_size: u64,
    /// How often the worker checks for process exit and cancellation.
    pub poll_interval: Duration,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of output from the copy tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stream: OutputStream,
    pub line: String,
    /// Bytes copied so far, when the line is a progress report.
    pub bytes_copied: Option<u64>,
}

impl ProgressEvent {
    fn new(stream: OutputStream, line: String) -> Self {
        let bytes_copied = parse_copied_bytes(&line);
        Self {
            stream,
            line,
            bytes_copied,
        }
    }

    /// Progress as a percentage of `total_bytes`, clamped to 100.
    pub fn percent_of(&self, total_bytes: u64) -> Option<f64> {
        let copied = self.bytes_copied?;
        if total_bytes == 0 {
            return None;
        }
        Some((copied as f64 / total_bytes as f64 * 100.0).min(100.0))
    }
}

/// Extracts the byte count from a dd progress line.
///
/// Handles GNU (`"1234 bytes (1.2 kB, 1.2 KiB) copied, 0.1 s, 12 kB/s"`) and
/// BSD (`"1234 bytes transferred in 0.1 secs (12340 bytes/sec)"`) wording.
pub fn parse_copied_bytes(line: &str) -> Option<u64> {
    let line = line.trim();
    if !(line.contains("copied") || line.contains("transferred")) {
        return None;
    }
    let mut words = line.split_whitespace();
    let count = words.next()?;
    if words.next()? != "bytes" {
        return None;
    }
    count.replace(',', "").parse().ok()
}

/// How a clone ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Non-zero exit. `None` when the tool was killed by a signal it did not expect.
    ProcessFailed { exit_code: Option<i32> },
    LaunchFailed { cause: String },
    Cancelled,
}

/// What the destination disk holds after the clone ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestinationState {
    /// The tool never ran; the destination was not written.
    Untouched,
    /// The copy completed.
    Cloned,
    /// The copy stopped part way; the destination's contents are undefined.
    Undefined,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneReport {
    pub outcome: Outcome,
    pub destination_state: DestinationState,
    /// Last byte count the tool reported, if any.
    pub bytes_copied: Option<u64>,
}

impl CloneReport {
    fn new(outcome: Outcome, bytes_copied: Option<u64>) -> Self {
        let destination_state = match outcome {
            Outcome::Success => DestinationState::Cloned,
            Outcome::LaunchFailed { .. } => DestinationState::Untouched,
            Outcome::ProcessFailed { .. } | Outcome::Cancelled => DestinationState::Undefined,
        };
        Self {
            outcome,
            destination_state,
            bytes_copied,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Maps every non-success outcome onto the matching [`Error`].
    pub fn into_result(self) -> Result<()> {
        match self.outcome {
            Outcome::Success => Ok(()),
            Outcome::ProcessFailed { exit_code } => Err(Error::ProcessFailed(exit_code)),
            Outcome::LaunchFailed { cause } => Err(Error::LaunchFailed(cause)),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloneEvent {
    Progress(ProgressEvent),
    Finished(CloneReport),
}

/// Requests cancellation of an in-flight clone. Cheap to clone and `Send`.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The caller's side of a running clone.
///
/// Events can be pulled with [`next_event`](Self::next_event) (blocking),
/// polled with [`try_next_event`](Self::try_next_event), or consumed through
/// the `Iterator` impl. Once the `Finished` event has been returned the
/// session yields nothing more.
pub struct CloneSession {
    events: Receiver<CloneEvent>,
    cancel: CancelHandle,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl CloneSession {
    /// Blocks until the next event arrives.
    pub fn next_event(&mut self) -> Option<CloneEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv() {
            Ok(event) => Some(self.observe(event)),
            Err(_) => self.worker_lost(),
        }
    }

    /// Returns the next event if one is ready, without blocking.
    pub fn try_next_event(&mut self) -> Option<CloneEvent> {
        if self.finished {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => Some(self.observe(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.worker_lost(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Discards remaining progress and returns the final report.
    pub fn wait(mut self) -> CloneReport {
        while let Some(event) = self.next_event() {
            if let CloneEvent::Finished(report) = event {
                return report;
            }
        }
        // Only reachable if the worker died without reporting.
        CloneReport::new(Outcome::ProcessFailed { exit_code: None }, None)
    }

    fn observe(&mut self, event: CloneEvent) -> CloneEvent {
        if matches!(event, CloneEvent::Finished(_)) {
            self.finished = true;
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
        event
    }

    fn worker_lost(&mut self) -> Option<CloneEvent> {
        error!("Clone worker exited without reporting an outcome");
        self.finished = true;
        Some(CloneEvent::Finished(CloneReport::new(
            Outcome::ProcessFailed { exit_code: None },
            None,
        )))
    }
}

impl Iterator for CloneSession {
    type Item = CloneEvent;

    fn next(&mut self) -> Option<CloneEvent> {
        self.next_event()
    }
}

/// Holds the orchestrator's clone slot; frees it on drop.
struct SlotGuard {
    active: Arc<Mutex<Option<u32>>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Launches and supervises clones.
pub struct Orchestrator {
    tool: Box<dyn CopyTool>,
    options: CloneOptions,
    is_elevated: fn() -> bool,
    active: Arc<Mutex<Option<u32>>>,
}

impl Orchestrator {
    pub fn new(tool: impl CopyTool + 'static) -> Self {
        Self {
            tool: Box::new(tool),
            options: CloneOptions::default(),
            is_elevated: crate::privilege::is_elevated,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_options(mut self, options: CloneOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the privilege probe run on every `execute`.
    pub fn with_privilege_check(mut self, is_elevated: fn() -> bool) -> Self {
        self.is_elevated = is_elevated;
        self
    }

    /// Destination index of the clone currently running, if any.
    pub fn active_destination(&self) -> Option<u32> {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts copying `plan`'s source onto its destination.
    ///
    /// Nothing is launched unless the plan is approved, `confirmation` is
    /// present and non-empty, the process is elevated, and no other clone is
    /// running. The copy itself runs on a worker thread; this call returns as
    /// soon as the worker is started.
    ///
    /// # Errors
    ///
    /// [`Error::NotApproved`], [`Error::MissingConfirmation`],
    /// [`Error::InsufficientPrivilege`] or [`Error::AlreadyInProgress`], checked
    /// in that order. Failures of the tool itself are reported through the
    /// session's final [`CloneReport`].
    pub fn execute(
        &self,
        plan: &ClonePlan,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<CloneSession> {
        if !plan.is_approved() {
            return Err(Error::NotApproved);
        }
        match confirmation {
            Some(token) if !token.is_empty() => {}
            _ => return Err(Error::MissingConfirmation),
        }
        if !(self.is_elevated)() {
            return Err(Error::InsufficientPrivilege);
        }
        if self.options.block_size == 0 {
            return Err(Error::LaunchFailed("block size must be non-zero".to_string()));
        }
        let slot = self.claim(plan.destination_index())?;

        let command = self.tool.command(
            plan.source_path(),
            plan.destination_path(),
            self.options.block_size,
            plan.copy_limit(),
        );
        info!(
            "Cloning disk {} ({}) onto disk {} ({})",
            plan.source_index(),
            plan.source_path().display(),
            plan.destination_index(),
            plan.destination_path().display()
        );

        let (tx, rx) = mpsc::channel();
        let cancel = CancelHandle::default();
        let worker_cancel = cancel.clone();
        let poll_interval = self.options.poll_interval;

        let worker = thread::Builder::new()
            .name("clonr-worker".to_string())
            .spawn(move || {
                let report = supervise(command, &worker_cancel, &tx, poll_interval);
                // Free the slot before the caller can observe the outcome.
                drop(slot);
                let _ = tx.send(CloneEvent::Finished(report));
            })
            .map_err(|e| Error::LaunchFailed(format!("could not start worker thread: {e}")))?;

        Ok(CloneSession {
            events: rx,
            cancel,
            worker: Some(worker),
            finished: false,
        })
    }

    fn claim(&self, destination_index: u32) -> Result<SlotGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = *active {
            warn!(
                "Refusing clone onto disk {destination_index}: clone onto disk {running} still running"
            );
            return Err(Error::AlreadyInProgress(destination_index));
        }
        *active = Some(destination_index);
        Ok(SlotGuard {
            active: Arc::clone(&self.active),
        })
    }
}

/// Shared between the output readers; holds the latest reported byte count.
type Copied = Arc<Mutex<Option<u64>>>;

fn supervise(
    mut command: Command,
    cancel: &CancelHandle,
    events: &Sender<CloneEvent>,
    poll_interval: Duration,
) -> CloneReport {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so cancelling also stops anything the tool started.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let cause = describe_launch_error(command.get_program(), &e);
            warn!("Copy tool did not start: {cause}");
            return CloneReport::new(Outcome::LaunchFailed { cause }, None);
        }
    };
    debug!("Copy tool started with pid {}", child.id());

    let copied: Copied = Arc::new(Mutex::new(None));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, OutputStream::Stdout, events, &copied));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, OutputStream::Stderr, events, &copied));
    }

    let status: io::Result<ExitStatus> = loop {
        if cancel.is_cancelled() {
            info!("Cancelling clone, killing pid {}", child.id());
            if let Err(e) = kill_tool(&mut child) {
                warn!("Failed to kill copy tool: {e}");
            }
            let _ = child.wait();
            join_readers(readers);
            return CloneReport::new(Outcome::Cancelled, last_copied(&copied));
        }
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                let _ = kill_tool(&mut child);
                let _ = child.wait();
                break Err(e);
            }
        }
    };
    join_readers(readers);

    let outcome = match status {
        Ok(status) if status.success() => Outcome::Success,
        Ok(status) => Outcome::ProcessFailed {
            exit_code: status.code(),
        },
        Err(e) => {
            error!("Lost track of copy tool: {e}");
            Outcome::ProcessFailed { exit_code: None }
        }
    };
    match &outcome {
        Outcome::Success => info!("Clone finished successfully"),
        other => warn!("Clone ended with {other:?}"),
    }
    CloneReport::new(outcome, last_copied(&copied))
}

/// Kills the tool's whole process group, falling back to the tool alone.
#[cfg(unix)]
fn kill_tool(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Could not signal process group {group}: {e}");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_tool(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn describe_launch_error(program: &std::ffi::OsStr, e: &io::Error) -> String {
    let program = program.to_string_lossy();
    match e.kind() {
        io::ErrorKind::NotFound => format!("'{program}' was not found; is it installed?"),
        io::ErrorKind::PermissionDenied => format!("permission denied running '{program}'"),
        _ => format!("'{program}': {e}"),
    }
}

fn last_copied(copied: &Copied) -> Option<u64> {
    *copied.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let _ = reader.join();
    }
}

/// Forwards `source` as line events. dd redraws its progress with `\r`, so
/// both `\r` and `\n` end a line.
fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: OutputStream,
    events: &Sender<CloneEvent>,
    copied: &Copied,
) -> JoinHandle<()> {
    let events = events.clone();
    let copied = Arc::clone(copied);
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut line = Vec::new();
        let emit = |line: &mut Vec<u8>| {
            let text = String::from_utf8_lossy(line).trim_end().to_string();
            line.clear();
            if text.is_empty() {
                return;
            }
            let event = ProgressEvent::new(stream, text);
            if let Some(bytes) = event.bytes_copied {
                *copied.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes);
            }
            // Keep draining even if nobody listens, so the tool never blocks on a full pipe.
            let _ = events.send(CloneEvent::Progress(event));
        };

        loop {
            let chunk = match reader.fill_buf() {
                Ok([]) => break,
                Ok(chunk) => chunk,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Stopped reading {stream:?}: {e}");
                    break;
                }
            };
            let len = chunk.len();
            for &byte in chunk {
                if byte == b'\n' || byte == b'\r' {
                    emit(&mut line);
                } else {
                    line.push(byte);
                }
            }
            reader.consume(len);
        }
        emit(&mut line);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{FakeHost, GB, disk};
    use crate::catalog::{Catalog, Snapshot};
    use crate::validate::{requires_confirmation, validate};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn dd_command_addresses_raw_devices() {
        let cmd = DdTool::default().command(
            Path::new("/dev/sdb"),
            Path::new("/dev/sdc"),
            DEFAULT_BLOCK_SIZE,
            None,
        );
        assert_eq!(cmd.get_program(), "dd");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "if=/dev/sdb",
                "of=/dev/sdc",
                "bs=4194304",
                "conv=fsync",
                "status=progress"
            ]
        );
    }

    fn block_args(limit: u64) -> Vec<String> {
        DdTool::default()
            .command(
                Path::new("/dev/sdb"),
                Path::new("/dev/sdc"),
                DEFAULT_BLOCK_SIZE,
                Some(limit),
            )
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .filter(|a| a.starts_with("bs=") || a.starts_with("count="))
            .collect()
    }

    #[test]
    fn dd_stops_at_the_limit() {
        assert_eq!(block_args(10 * DEFAULT_BLOCK_SIZE), vec!["bs=4194304", "count=10"]);
        // Not a whole number of 4 MiB blocks: fall back to a block size that divides it.
        assert_eq!(
            block_args(10 * DEFAULT_BLOCK_SIZE + 512),
            vec!["bs=512", "count=81921"]
        );
    }

    #[test]
    fn parses_dd_progress_lines() {
        assert_eq!(
            parse_copied_bytes("1234567168 bytes (1.2 GB, 1.1 GiB) copied, 5.1 s, 242 MB/s"),
            Some(1_234_567_168)
        );
        assert_eq!(
            parse_copied_bytes("8589934592 bytes transferred in 40.1 secs (214213816 bytes/sec)"),
            Some(8_589_934_592)
        );
        assert_eq!(parse_copied_bytes("2048+0 records in"), None);
        assert_eq!(parse_copied_bytes("dd: error writing '/dev/sdc': No space left on device"), None);
        assert_eq!(parse_copied_bytes(""), None);
    }

    #[test]
    fn percent_needs_a_byte_count_and_a_total() {
        let event = ProgressEvent::new(
            OutputStream::Stderr,
            "500 bytes (500 B) copied, 0.1 s".to_string(),
        );
        assert_eq!(event.percent_of(1000), Some(50.0));
        assert_eq!(event.percent_of(0), None);
        assert_eq!(event.percent_of(100), Some(100.0));
        let plain = ProgressEvent::new(OutputStream::Stdout, "hello".to_string());
        assert_eq!(plain.percent_of(1000), None);
    }

    #[test]
    fn report_maps_outcomes_to_destination_state() {
        let state = |o| CloneReport::new(o, None).destination_state;
        assert_eq!(state(Outcome::Success), DestinationState::Cloned);
        assert_eq!(state(Outcome::Cancelled), DestinationState::Undefined);
        assert_eq!(
            state(Outcome::ProcessFailed { exit_code: Some(1) }),
            DestinationState::Undefined
        );
        assert_eq!(
            state(Outcome::LaunchFailed {
                cause: "x".to_string()
            }),
            DestinationState::Untouched
        );
    }

    #[test]
    fn report_into_result() {
        assert!(CloneReport::new(Outcome::Success, None).into_result().is_ok());
        assert!(matches!(
            CloneReport::new(Outcome::Cancelled, None).into_result(),
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            CloneReport::new(Outcome::ProcessFailed { exit_code: Some(2) }, None).into_result(),
            Err(Error::ProcessFailed(Some(2)))
        ));
    }

    /// A copy tool that runs a shell snippet and counts how often it is invoked.
    struct ScriptTool {
        script: String,
        launches: Arc<AtomicUsize>,
    }

    impl ScriptTool {
        fn new(script: &str) -> (Self, Arc<AtomicUsize>) {
            let launches = Arc::new(AtomicUsize::new(0));
            let tool = Self {
                script: script.to_string(),
                launches: Arc::clone(&launches),
            };
            (tool, launches)
        }
    }

    impl CopyTool for ScriptTool {
        fn command(
            &self,
            _source: &Path,
            _destination: &Path,
            _block_size: u64,
            _limit: Option<u64>,
        ) -> Command {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.script);
            cmd
        }
    }

    fn elevated() -> bool {
        true
    }

    fn not_elevated() -> bool {
        false
    }

    fn orchestrator(script: &str) -> (Orchestrator, Arc<AtomicUsize>) {
        let (tool, launches) = ScriptTool::new(script);
        let orch = Orchestrator::new(tool)
            .with_privilege_check(elevated)
            .with_options(CloneOptions {
                poll_interval: Duration::from_millis(10),
                ..CloneOptions::default()
            });
        (orch, launches)
    }

    fn three_disks() -> Snapshot {
        let host = FakeHost {
            disks: Some(vec![disk(0, GB, "A"), disk(1, GB, "B"), disk(2, GB, "C")]),
            volumes: Some(Vec::new()),
        };
        Catalog::new(host).refresh().unwrap()
    }

    fn approved(snapshot: &Snapshot, source: u32, destination: u32) -> ClonePlan {
        validate(snapshot, source, destination).unwrap()
    }

    fn token(plan: &ClonePlan) -> Option<ConfirmationToken> {
        Some(requires_confirmation(plan).accept())
    }

    #[test]
    fn malformed_requests_never_launch_the_tool() {
        let snapshot = three_disks();
        let (orch, launches) = orchestrator("exit 0");
        let draft = ClonePlan::draft(&snapshot.disks()[0], &snapshot.disks()[1]);
        let plan = approved(&snapshot, 0, 1);

        let cases: Vec<(&ClonePlan, Option<ConfirmationToken>)> = vec![
            (&draft, None),
            (&draft, Some(ConfirmationToken::new("yes"))),
            (&draft, token(&plan)),
            (&plan, None),
            (&plan, Some(ConfirmationToken::new(""))),
            (&plan, Some(ConfirmationToken::new("  "))),
        ];
        for (p, t) in cases {
            let err = orch.execute(p, t).err().expect("must be refused");
            assert!(matches!(err, Error::NotApproved | Error::MissingConfirmation));
        }
        assert_eq!(launches.load(Ordering::SeqCst), 0);
        assert_eq!(orch.active_destination(), None);
    }

    #[test]
    fn approval_is_checked_before_confirmation() {
        let snapshot = three_disks();
        let (orch, _) = orchestrator("exit 0");
        let draft = ClonePlan::draft(&snapshot.disks()[0], &snapshot.disks()[1]);
        assert!(matches!(orch.execute(&draft, None), Err(Error::NotApproved)));
    }

    #[test]
    fn unprivileged_execute_is_refused() {
        let snapshot = three_disks();
        let (tool, launches) = ScriptTool::new("exit 0");
        let orch = Orchestrator::new(tool).with_privilege_check(not_elevated);
        let plan = approved(&snapshot, 0, 1);

        let result = orch.execute(&plan, token(&plan));
        assert!(matches!(result, Err(Error::InsufficientPrivilege)));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_block_size_is_refused_before_launch() {
        let snapshot = three_disks();
        let (tool, launches) = ScriptTool::new("exit 0");
        let orch = Orchestrator::new(tool)
            .with_privilege_check(elevated)
            .with_options(CloneOptions {
                block_size: 0,
                ..CloneOptions::default()
            });
        let plan = approved(&snapshot, 0, 1);

        assert!(matches!(
            orch.execute(&plan, token(&plan)),
            Err(Error::LaunchFailed(_))
        ));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
        assert_eq!(orch.active_destination(), None);
    }

    #[cfg(unix)]
    #[test]
    fn successful_clone_streams_output_then_finishes() {
        let snapshot = three_disks();
        let (orch, launches) = orchestrator(
            "printf '100 bytes (100 B) copied, 0.1 s\\r200 bytes (200 B) copied, 0.2 s\\r'; \
             echo 'records out' >&2; echo done",
        );
        let plan = approved(&snapshot, 0, 1);

        let events: Vec<CloneEvent> = orch.execute(&plan, token(&plan)).unwrap().collect();
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        let (last, progress) = events.split_last().unwrap();
        let stdout: Vec<_> = progress
            .iter()
            .filter_map(|e| match e {
                CloneEvent::Progress(p) if p.stream == OutputStream::Stdout => Some(p.line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            stdout,
            vec![
                "100 bytes (100 B) copied, 0.1 s",
                "200 bytes (200 B) copied, 0.2 s",
                "done"
            ]
        );
        assert!(progress.iter().any(|e| matches!(
            e,
            CloneEvent::Progress(p) if p.stream == OutputStream::Stderr && p.line == "records out"
        )));
        assert_eq!(
            last,
            &CloneEvent::Finished(CloneReport {
                outcome: Outcome::Success,
                destination_state: DestinationState::Cloned,
                bytes_copied: Some(200),
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_process_failed() {
        let snapshot = three_disks();
        let (orch, _) = orchestrator("echo 'dd: No space left on device' >&2; exit 3");
        let plan = approved(&snapshot, 0, 1);

        let report = orch.execute(&plan, token(&plan)).unwrap().wait();
        assert_eq!(
            report.outcome,
            Outcome::ProcessFailed { exit_code: Some(3) }
        );
        assert_eq!(report.destination_state, DestinationState::Undefined);
        assert!(matches!(report.into_result(), Err(Error::ProcessFailed(Some(3)))));
    }

    #[test]
    fn missing_tool_is_launch_failed() {
        let snapshot = three_disks();
        let orch = Orchestrator::new(DdTool::new("/nonexistent/clonr-copy-tool"))
            .with_privilege_check(elevated);
        let plan = approved(&snapshot, 0, 1);

        let report = orch.execute(&plan, token(&plan)).unwrap().wait();
        match &report.outcome {
            Outcome::LaunchFailed { cause } => assert!(cause.contains("clonr-copy-tool")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.destination_state, DestinationState::Untouched);
        assert_eq!(orch.active_destination(), None);
    }

    #[cfg(unix)]
    #[test]
    fn cancelling_leaves_destination_undefined() {
        let snapshot = three_disks();
        let (orch, _) = orchestrator("echo started; exec sleep 30");
        let plan = approved(&snapshot, 0, 1);

        let mut session = orch.execute(&plan, token(&plan)).unwrap();
        match session.next_event() {
            Some(CloneEvent::Progress(p)) => assert_eq!(p.line, "started"),
            other => panic!("unexpected event {other:?}"),
        }

        let started = Instant::now();
        let handle = session.cancel_handle();
        thread::spawn(move || handle.cancel());
        let report = session.wait();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.destination_state, DestinationState::Undefined);
        assert!(matches!(report.into_result(), Err(Error::Cancelled)));
    }

    #[cfg(unix)]
    #[test]
    fn cancelling_also_stops_processes_the_tool_started() {
        let snapshot = three_disks();
        // sleep runs as a child of sh and holds the output pipes open.
        let (orch, _) = orchestrator("echo started; sleep 30; echo after");
        let plan = approved(&snapshot, 0, 1);

        let mut session = orch.execute(&plan, token(&plan)).unwrap();
        assert!(matches!(session.next_event(), Some(CloneEvent::Progress(_))));

        let started = Instant::now();
        session.cancel();
        let report = session.wait();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(orch.active_destination(), None);
    }

    #[cfg(unix)]
    #[test]
    fn second_clone_is_refused_while_one_is_running() {
        let snapshot = three_disks();
        let (orch, launches) = orchestrator("exec sleep 30");
        let first = approved(&snapshot, 0, 1);
        let session = orch.execute(&first, token(&first)).unwrap();
        assert_eq!(orch.active_destination(), Some(1));

        // Same destination.
        let again = approved(&snapshot, 2, 1);
        assert!(matches!(
            orch.execute(&again, token(&again)),
            Err(Error::AlreadyInProgress(1))
        ));
        // A different destination is refused too: one clone at a time.
        let other = approved(&snapshot, 0, 2);
        assert!(matches!(
            orch.execute(&other, token(&other)),
            Err(Error::AlreadyInProgress(2))
        ));
        assert_eq!(launches.load(Ordering::SeqCst), 1);

        session.cancel();
        assert_eq!(session.wait().outcome, Outcome::Cancelled);
        assert_eq!(orch.active_destination(), None);
    }

    #[cfg(unix)]
    #[test]
    fn slot_is_free_once_finished_is_observed() {
        let snapshot = three_disks();
        let (orch, launches) = orchestrator("exit 0");
        let plan = approved(&snapshot, 0, 1);

        for _ in 0..3 {
            let report = orch.execute(&plan, token(&plan)).unwrap().wait();
            assert!(report.is_success());
        }
        assert_eq!(launches.load(Ordering::SeqCst), 3);
    }

    #[cfg(unix)]
    #[test]
    fn polling_does_not_block_and_ends_after_finished() {
        let snapshot = three_disks();
        let (orch, _) = orchestrator("sleep 0.2; echo done");
        let plan = approved(&snapshot, 0, 1);
        let mut session = orch.execute(&plan, token(&plan)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut report = None;
        while report.is_none() && Instant::now() < deadline {
            match session.try_next_event() {
                Some(CloneEvent::Finished(r)) => report = Some(r),
                Some(CloneEvent::Progress(_)) => {}
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(report.expect("clone should finish").is_success());
        assert!(session.is_finished());
        assert_eq!(session.try_next_event(), None);
        assert_eq!(session.next_event(), None);
    }
}
