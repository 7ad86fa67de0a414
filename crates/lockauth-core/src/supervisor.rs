//! Session supervision: run the checking process and serve its requests.
//!
//! The checking process (`lockauth-authproto`) is spawned with two pipes.
//! Its standard output carries request packets to us and its standard input
//! carries our responses back. Every request is answered through the
//! [`PromptEngine`], and the verdict is read from the child's exit status
//! once the request stream ends.
//!
//! The child never learns anything about the UI, and the UI never sees a
//! failure reason: a session only ever yields [`Verdict::Authenticated`] or
//! [`Verdict::Denied`].

use std::ffi::{CString, NulError};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authproto::{read_packet, write_packet, ChannelError, PacketType};
use crate::prompt::engine::ERROR_TITLE;
use crate::prompt::{PromptEngine, PromptOutcome};
use crate::types::Verdict;

/// Title of informational messages relayed from the backend.
pub const INFO_TITLE: &str = "PAM says";

/// Shown while the checking process works on an answer.
pub const PROCESSING_TITLE: &str = "Processing...";

/// How long a failed exec lingers before exiting, to slow down retry loops.
const EXEC_FAILURE_DELAY_SECS: libc::c_uint = 2;

/// Pid of the running checking process, or 0. Read by signal handlers.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Errors that can occur while supervising a checking process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The executable path contains a NUL byte.
    #[error("invalid executable path: {0}")]
    InvalidPath(#[from] NulError),

    /// A pipe could not be created.
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] Errno),

    /// The process could not be forked.
    #[error("failed to fork: {0}")]
    Fork(#[source] Errno),

    /// Waiting for the child failed.
    #[error("failed to wait for checking process: {0}")]
    Wait(#[source] Errno),

    /// A signal handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] Errno),
}

/// A spawned checking process and our ends of its pipes.
///
/// Must be finished with [`ChildProcess::wait`]; dropping it leaves a zombie.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    requests: File,
    responses: File,
}

impl ChildProcess {
    /// Fork and exec `executable` with its stdin and stdout on fresh pipes.
    ///
    /// Stderr is inherited. If the exec fails, the child waits two seconds
    /// and exits with status 1, which reads as [`Verdict::Denied`].
    pub fn spawn(executable: &Path) -> Result<Self, SupervisorError> {
        // Everything the child touches is prepared before forking.
        let program = CString::new(executable.as_os_str().as_bytes())?;
        let argv: [*const libc::c_char; 2] = [program.as_ptr(), std::ptr::null()];

        let (requests, child_stdout) = pipe2(OFlag::O_CLOEXEC).map_err(SupervisorError::Pipe)?;
        let (child_stdin, responses) = pipe2(OFlag::O_CLOEXEC).map_err(SupervisorError::Pipe)?;

        // SAFETY: the child only makes async-signal-safe calls before exec.
        let fork_result = unsafe { fork() }.map_err(SupervisorError::Fork)?;
        match fork_result {
            ForkResult::Child => {
                // SAFETY: we are in the forked child; `program` and `argv`
                // were built before the fork and outlive this call.
                unsafe {
                    exec_child(
                        program.as_ptr(),
                        argv.as_ptr(),
                        child_stdin.as_raw_fd(),
                        child_stdout.as_raw_fd(),
                    )
                }
            }
            ForkResult::Parent { child } => {
                drop(child_stdin);
                drop(child_stdout);
                debug!(pid = child.as_raw(), executable = %executable.display(), "Spawned checking process");
                Ok(Self {
                    pid: child,
                    requests: File::from(requests),
                    responses: File::from(responses),
                })
            }
        }
    }

    /// Pid of the child.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Our ends of the pipes: requests from the child, responses to it.
    pub fn pipes(&mut self) -> (&mut File, &mut File) {
        (&mut self.requests, &mut self.responses)
    }

    /// Close both pipes and reap the child.
    ///
    /// Exit status 0 is [`Verdict::Authenticated`]. Any other exit status,
    /// or death by a signal, is [`Verdict::Denied`]. A child that was
    /// already reaped elsewhere means our process state is corrupt, so this
    /// aborts.
    ///
    /// The signal handlers stop targeting the child after it has exited
    /// but before it is reaped, while its pid cannot be reused yet.
    pub fn wait(self) -> Result<Verdict, SupervisorError> {
        let ChildProcess {
            pid,
            requests,
            responses,
        } = self;
        drop(requests);
        drop(responses);

        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    error!(pid = pid.as_raw(), "Checking process vanished before it was reaped");
                    std::process::abort();
                }
                Err(e) => return Err(SupervisorError::Wait(e)),
            }
        }
        let _ = CHILD_PID.compare_exchange(pid.as_raw(), 0, Ordering::SeqCst, Ordering::SeqCst);

        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(pid = pid.as_raw(), code, "Checking process exited");
                    return Ok(Verdict::from_exit_code(code));
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    warn!(pid = pid.as_raw(), %signal, "Checking process was killed");
                    return Ok(Verdict::Denied);
                }
                Ok(status) => debug!(?status, "Ignoring checking process status change"),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    error!(pid = pid.as_raw(), "Checking process vanished before it was reaped");
                    std::process::abort();
                }
                Err(e) => return Err(SupervisorError::Wait(e)),
            }
        }
    }
}

/// Move the pipe ends onto stdin and stdout, then exec.
///
/// # Safety
///
/// Must only be called in a freshly forked child. Never returns.
unsafe fn exec_child(
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
) -> ! {
    // Installing stdin first would clobber a request pipe that sits on fd 0.
    let mut out = stdout_fd;
    if out == libc::STDIN_FILENO {
        out = libc::dup(out);
        if out < 0 {
            libc::_exit(1);
        }
    }
    if !install_fd(stdin_fd, libc::STDIN_FILENO) || !install_fd(out, libc::STDOUT_FILENO) {
        libc::_exit(1);
    }
    if out != stdout_fd {
        libc::close(out);
    }

    libc::execv(program, argv);
    libc::sleep(EXEC_FAILURE_DELAY_SECS);
    libc::_exit(1)
}

/// Make `fd` available as `target` across exec.
///
/// # Safety
///
/// Async-signal-safe; `fd` must be open.
unsafe fn install_fd(fd: RawFd, target: RawFd) -> bool {
    if fd == target {
        // dup2 onto itself would keep close-on-exec set.
        libc::fcntl(fd, libc::F_SETFD, 0) >= 0
    } else {
        libc::dup2(fd, target) >= 0
    }
}

extern "C" fn forward_signal(signal: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(pid, libc::SIGKILL) };
    }
    if signal == libc::SIGTERM {
        // The handler was reset on entry, so this terminates us once we
        // return.
        // SAFETY: raise is async-signal-safe.
        unsafe { libc::raise(libc::SIGTERM) };
    }
}

/// Install the SIGUSR1 and SIGTERM handlers.
///
/// Both kill a running checking process. SIGUSR1 then lets the session
/// wind down to [`Verdict::Denied`]; SIGTERM also terminates this process.
pub fn install_signal_forwarding() -> Result<(), SupervisorError> {
    let kill_child = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let kill_child_and_exit = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic and async-signal-safe calls.
    unsafe {
        sigaction(Signal::SIGUSR1, &kill_child).map_err(SupervisorError::Signal)?;
        sigaction(Signal::SIGTERM, &kill_child_and_exit).map_err(SupervisorError::Signal)?;
    }
    debug!("Signal forwarding installed");
    Ok(())
}

/// Drives one authentication session.
pub struct SessionSupervisor {
    executable: PathBuf,
    engine: PromptEngine,
    last_message: Option<(String, String, bool)>,
}

impl SessionSupervisor {
    /// Supervise sessions of the checking process at `executable`.
    pub fn new(executable: impl Into<PathBuf>, engine: PromptEngine) -> Self {
        Self {
            executable: executable.into(),
            engine,
            last_message: None,
        }
    }

    /// Run one session to its verdict.
    ///
    /// Never fails: a checking process that cannot be started, or any
    /// protocol trouble, ends in [`Verdict::Denied`]. On success the
    /// renderer is told before this returns.
    pub fn run(&mut self) -> Verdict {
        self.last_message = None;
        let mut child = match ChildProcess::spawn(&self.executable) {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to start checking process");
                return Verdict::Denied;
            }
        };
        CHILD_PID.store(child.pid().as_raw(), Ordering::SeqCst);

        let (requests, responses) = child.pipes();
        if let Err(e) = self.dispatch(requests, responses) {
            warn!(error = %e, "Conversation with checking process ended early");
        }

        let verdict = match child.wait() {
            Ok(verdict) => verdict,
            Err(e) => {
                CHILD_PID.store(0, Ordering::SeqCst);
                error!(error = %e, "Could not collect checking process status");
                Verdict::Denied
            }
        };

        info!(%verdict, "Session finished");
        if verdict.is_authenticated() {
            self.engine.notify_success();
        }
        verdict
    }

    /// Serve requests until the stream ends.
    ///
    /// Returns `Ok` on a clean end of stream or a packet that has no place
    /// on the request stream, and an error when reading or answering fails.
    pub fn dispatch<R, W>(&mut self, requests: &mut R, responses: &mut W) -> Result<(), ChannelError>
    where
        R: Read + AsFd,
        W: Write,
    {
        loop {
            self.wait_for_request(requests.as_fd())?;
            let packet = match read_packet(requests, true) {
                Ok(packet) => packet,
                Err(ChannelError::UnknownPacketType(byte)) => {
                    warn!(packet_type = byte, "Unknown request from checking process");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match packet.kind() {
                PacketType::InfoMessage => self.alert(INFO_TITLE, &packet.text(), false),
                PacketType::ErrorMessage => self.alert(ERROR_TITLE, &packet.text(), true),
                PacketType::PromptEcho | PacketType::PromptHidden => {
                    let echo = packet.kind() == PacketType::PromptEcho;
                    let answer = self.engine.prompt(&packet.text(), echo);
                    drop(packet);
                    match answer {
                        PromptOutcome::Submitted(buf) => {
                            let kind = if echo {
                                PacketType::ResponseEcho
                            } else {
                                PacketType::ResponseHidden
                            };
                            write_packet(responses, kind, buf.as_bytes())?;
                        }
                        PromptOutcome::Cancelled(reason) => {
                            debug!(%reason, "Answering prompt as cancelled");
                            write_packet(responses, PacketType::ResponseCancelled, b"")?;
                        }
                    }
                    self.show(PROCESSING_TITLE, "", false);
                }
                PacketType::Eof => {
                    debug!("Checking process closed its request stream");
                    return Ok(());
                }
                kind @ (PacketType::ResponseEcho
                | PacketType::ResponseHidden
                | PacketType::ResponseCancelled) => {
                    warn!(packet_type = %kind, "Unexpected request from checking process");
                    return Ok(());
                }
            }
        }
    }

    /// Block until a request is readable, redrawing when surfaces change.
    fn wait_for_request(&mut self, requests: BorrowedFd<'_>) -> Result<(), ChannelError> {
        let tick = self.engine.settings().blink_interval;
        let millis = u16::try_from(tick.as_millis()).unwrap_or(u16::MAX);
        loop {
            let mut fds = [PollFd::new(requests, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => {
                    if self.engine.surfaces_changed() {
                        if let Some((title, body, is_warning)) = self.last_message.clone() {
                            debug!("Display surfaces changed, redrawing");
                            self.engine.show_message(&title, &body, is_warning);
                        }
                    }
                }
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ChannelError::Io(e.into())),
            }
        }
    }

    fn show(&mut self, title: &str, body: &str, is_warning: bool) {
        self.engine.show_message(title, body, is_warning);
        self.last_message = Some((title.to_string(), body.to_string(), is_warning));
    }

    fn alert(&mut self, title: &str, body: &str, is_warning: bool) {
        self.engine.alert(title, body, is_warning);
        self.last_message = Some((title.to_string(), body.to_string(), is_warning));
    }
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("executable", &self.executable)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authproto::Packet;
    use crate::mock::{KeyEvent, ManualClock, RecordingRenderer, ScriptedKeys};
    use crate::prompt::PromptSettings;
    use std::time::Duration;

    /// A request stream holding `raw`, with the writer already closed.
    fn closed_requests(raw: &[u8]) -> File {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC).unwrap();
        File::from(writer).write_all(raw).unwrap();
        File::from(reader)
    }

    fn encode(packets: &[(PacketType, &[u8])]) -> Vec<u8> {
        let mut raw = Vec::new();
        for (kind, payload) in packets {
            write_packet(&mut raw, *kind, payload).unwrap();
        }
        raw
    }

    fn engine(keys: &[u8]) -> (PromptEngine, RecordingRenderer) {
        let clock = ManualClock::new();
        let events: Vec<KeyEvent> = keys.iter().map(|b| KeyEvent::Byte(*b)).collect();
        let keys = ScriptedKeys::new(events, clock.clone());
        let renderer = RecordingRenderer::new();
        let engine = PromptEngine::new(renderer.clone(), keys, PromptSettings::default()).with_clock(clock);
        (engine, renderer)
    }

    /// Dispatch `raw` requests with `keys` typed, returning what was sent back.
    fn serve(raw: &[u8], keys: &[u8]) -> (Result<(), ChannelError>, Vec<Packet>, RecordingRenderer) {
        let (engine, renderer) = engine(keys);
        let mut sup = SessionSupervisor::new("/nonexistent", engine);
        let mut requests = closed_requests(raw);
        let mut sent = Vec::new();
        let result = sup.dispatch(&mut requests, &mut sent);

        let mut cursor = std::io::Cursor::new(sent);
        let mut answers = Vec::new();
        loop {
            let packet = read_packet(&mut cursor, true).unwrap();
            if packet.kind() == PacketType::Eof {
                break;
            }
            answers.push(packet);
        }
        (result, answers, renderer)
    }

    #[test]
    fn hidden_prompt_is_answered_then_processing_shown() {
        let raw = encode(&[(PacketType::PromptHidden, b"Password: ")]);
        let (result, answers, renderer) = serve(&raw, b"hunter2\r");
        result.unwrap();

        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].kind(), PacketType::ResponseHidden);
        assert_eq!(answers[0].payload(), b"hunter2");
        assert_eq!(renderer.prompts()[0].0, "Password: ");
        assert_eq!(
            renderer.messages(),
            vec![(PROCESSING_TITLE.to_string(), String::new(), false)]
        );
    }

    #[test]
    fn echo_prompt_is_answered_as_echo() {
        let raw = encode(&[(PacketType::PromptEcho, b"Login: ")]);
        let (result, answers, _) = serve(&raw, b"alice\n");
        result.unwrap();
        assert_eq!(answers[0].kind(), PacketType::ResponseEcho);
        assert_eq!(answers[0].payload(), b"alice");
    }

    #[test]
    fn cancelled_prompt_sends_cancellation() {
        let raw = encode(&[(PacketType::PromptHidden, b"Password: ")]);
        let (result, answers, renderer) = serve(&raw, b"abc\x1b");
        result.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].kind(), PacketType::ResponseCancelled);
        assert!(answers[0].payload().is_empty());
        assert_eq!(renderer.messages()[0].0, PROCESSING_TITLE);
    }

    #[test]
    fn each_prompt_gets_its_own_answer() {
        let raw = encode(&[
            (PacketType::PromptEcho, b"Login: "),
            (PacketType::PromptHidden, b"Password: "),
        ]);
        let (result, answers, _) = serve(&raw, b"bob\rpw\r");
        result.unwrap();
        let payloads: Vec<&[u8]> = answers.iter().map(|p| p.payload()).collect();
        assert_eq!(payloads, vec![&b"bob"[..], &b"pw"[..]]);
    }

    #[test]
    fn messages_are_alerted_without_response() {
        let raw = encode(&[
            (PacketType::InfoMessage, b"Last login today"),
            (PacketType::ErrorMessage, b"Account locked"),
        ]);
        let (result, answers, renderer) = serve(&raw, b"");
        result.unwrap();

        assert!(answers.is_empty());
        assert_eq!(
            renderer.messages(),
            vec![
                (INFO_TITLE.to_string(), "Last login today".to_string(), false),
                (ERROR_TITLE.to_string(), "Account locked".to_string(), true),
            ]
        );
    }

    #[test]
    fn response_on_request_stream_stops_dispatch() {
        let raw = encode(&[
            (PacketType::ResponseHidden, b"odd"),
            (PacketType::InfoMessage, b"never shown"),
        ]);
        let (result, answers, renderer) = serve(&raw, b"");
        result.unwrap();
        assert!(answers.is_empty());
        assert!(renderer.events().is_empty());
    }

    #[test]
    fn unknown_request_stops_dispatch() {
        let mut raw = vec![b'?', 0, 0, 0, 1, b'x'];
        raw.extend(encode(&[(PacketType::InfoMessage, b"never shown")]));
        let (result, _, renderer) = serve(&raw, b"");
        result.unwrap();
        assert!(renderer.events().is_empty());
    }

    #[test]
    fn truncated_request_is_an_error() {
        let (result, _, renderer) = serve(&[b'P', 0, 0, 0, 9, b'x'], b"");
        assert!(matches!(result, Err(ChannelError::Truncated { .. })));
        assert!(renderer.prompts().is_empty());
    }

    #[test]
    fn surface_change_redraws_last_message_while_waiting() {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut writer = File::from(writer);
        write_packet(&mut writer, PacketType::InfoMessage, b"hello").unwrap();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(700));
            drop(writer);
        });

        let (engine, renderer) = engine(b"");
        let mut sup = SessionSupervisor::new("/nonexistent", engine);
        renderer.change_surfaces();
        sup.dispatch(&mut File::from(reader), &mut Vec::new()).unwrap();
        closer.join().unwrap();

        let expected = (INFO_TITLE.to_string(), "hello".to_string(), false);
        assert_eq!(renderer.messages(), vec![expected.clone(), expected]);
    }

    #[test]
    fn nul_in_path_is_rejected() {
        let err = ChildProcess::spawn(Path::new("/bin/t\0rue")).unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPath(_)));
    }

    #[test]
    fn child_exit_codes_map_to_verdicts() {
        let child = ChildProcess::spawn(Path::new("/bin/true")).unwrap();
        assert_eq!(child.wait().unwrap(), Verdict::Authenticated);

        let child = ChildProcess::spawn(Path::new("/bin/false")).unwrap();
        assert_eq!(child.wait().unwrap(), Verdict::Denied);
    }

    #[test]
    fn reaped_child_is_no_longer_a_signal_target() {
        let child = ChildProcess::spawn(Path::new("/bin/true")).unwrap();
        let pid = child.pid().as_raw();
        CHILD_PID.store(pid, Ordering::SeqCst);
        assert_eq!(child.wait().unwrap(), Verdict::Authenticated);
        assert_ne!(CHILD_PID.load(Ordering::SeqCst), pid);
    }

    #[test]
    fn killed_child_is_denied() {
        let child = ChildProcess::spawn(Path::new("/bin/cat")).unwrap();
        nix::sys::signal::kill(child.pid(), Signal::SIGKILL).unwrap();
        assert_eq!(child.wait().unwrap(), Verdict::Denied);
    }

    #[test]
    fn successful_session_notifies_renderer() {
        let (engine, renderer) = engine(b"");
        let mut sup = SessionSupervisor::new("/bin/true", engine);
        assert_eq!(sup.run(), Verdict::Authenticated);
        assert_eq!(renderer.success_count(), 1);
    }

    #[test]
    fn failed_session_does_not_notify() {
        let (engine, renderer) = engine(b"");
        let mut sup = SessionSupervisor::new("/bin/false", engine);
        assert_eq!(sup.run(), Verdict::Denied);
        assert_eq!(renderer.success_count(), 0);
    }

    #[test]
    fn missing_executable_is_denied() {
        let (engine, renderer) = engine(b"");
        let mut sup = SessionSupervisor::new("/nonexistent/lockauth-authproto", engine);
        assert_eq!(sup.run(), Verdict::Denied);
        assert_eq!(renderer.success_count(), 0);
    }
}
