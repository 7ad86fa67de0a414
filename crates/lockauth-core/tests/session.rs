//! End-to-end sessions across two real processes.
//!
//! This binary plays both roles. Run normally, it acts as the UI process:
//! for each scenario it sets `LOCKAUTH_TEST_SCENARIO` and supervises a copy
//! of itself. Started with that variable set, it acts as the checking
//! process, running a scripted backend over its stdin and stdout.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use lockauth_core::authproto::{read_packet, write_packet, PacketType};
use lockauth_core::mock::{BackendCall, RecordingRenderer, ScriptedBackend};
use lockauth_core::supervisor::{INFO_TITLE, PROCESSING_TITLE};
use lockauth_core::{
    AuthStatus, ChannelConversation, ChildProcess, Converser, CredentialChecker, Identity,
    KeyboardInput, PromptEngine, PromptSettings, RetryPolicy, SessionSupervisor, Verdict,
};
use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult};

const SCENARIO_VAR: &str = "LOCKAUTH_TEST_SCENARIO";

fn main() -> ExitCode {
    match std::env::var(SCENARIO_VAR) {
        Ok(scenario) => checking_process(&scenario),
        Err(_) => {
            run("correct_password_authenticates", correct_password_authenticates);
            run("escape_denies_after_one_prompt", escape_denies_after_one_prompt);
            run("error_message_is_shown_for_a_second", error_message_is_shown_for_a_second);
            run("wrong_password_is_retried_three_times", wrong_password_is_retried_three_times);
            run("info_message_then_success", info_message_then_success);
            run("missing_checker_denies", missing_checker_denies);
            run("spawn_with_stdin_closed", spawn_with_stdin_closed);
            run("spawn_with_stdin_and_stdout_closed", spawn_with_stdin_and_stdout_closed);
            ExitCode::SUCCESS
        }
    }
}

fn run(name: &str, test: fn()) {
    print!("test {} ... ", name);
    let _ = io::stdout().flush();
    test();
    println!("ok");
}

/// The checking-process side: a scripted backend over stdin and stdout.
fn checking_process(scenario: &str) -> ExitCode {
    let channel = match ChannelConversation::stdio() {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("cannot open channel: {e}");
            return ExitCode::from(2);
        }
    };
    let converser = Converser::shared(channel);
    let backend = ScriptedBackend::new(converser.clone());
    let backend = match scenario {
        "password" => backend.on_authenticate(
            BackendCall::prompt_hidden(b"Password: ")
                .expecting(b"abc")
                .returns(AuthStatus::Success),
        ),
        "locked" => backend.on_authenticate(
            BackendCall::error_alert(b"Account locked").returns(AuthStatus::MaxAttemptsReached),
        ),
        "motd" => backend
            .on_authenticate(
                BackendCall::prompt_hidden(b"Password: ")
                    .expecting(b"abc")
                    .returns(AuthStatus::Success),
            )
            .on_account(BackendCall::info_alert(b"Welcome back")),
        other => {
            eprintln!("unknown scenario {other}");
            return ExitCode::from(2);
        }
    };

    let mut checker = CredentialChecker::new(backend, converser, RetryPolicy::default());
    let status = checker.authenticate(&Identity::new("tester", "localhost"));
    ExitCode::from(Verdict::from_status(status).exit_code())
}

struct Session {
    supervisor: SessionSupervisor,
    renderer: RecordingRenderer,
    keyboard: File,
}

/// A UI process whose keyboard is a pipe, supervising this binary.
fn session(scenario: &str) -> Session {
    std::env::set_var(SCENARIO_VAR, scenario);
    let exe = std::env::current_exe().unwrap();
    session_for(exe)
}

fn session_for(executable: PathBuf) -> Session {
    let (keys, keyboard) = pipe2(OFlag::O_CLOEXEC).unwrap();
    let renderer = RecordingRenderer::new();
    let engine = PromptEngine::new(
        renderer.clone(),
        KeyboardInput::from_fd(keys),
        PromptSettings::default(),
    );
    Session {
        supervisor: SessionSupervisor::new(executable, engine),
        renderer,
        keyboard: File::from(keyboard),
    }
}

fn correct_password_authenticates() {
    let mut s = session("password");
    s.keyboard.write_all(b"abc\r").unwrap();

    assert_eq!(s.supervisor.run(), Verdict::Authenticated);
    assert_eq!(s.renderer.success_count(), 1);
    assert_eq!(s.renderer.prompts()[0].0, "Password: ");
}

fn escape_denies_after_one_prompt() {
    let mut s = session("password");
    s.keyboard.write_all(b"\x1b").unwrap();

    assert_eq!(s.supervisor.run(), Verdict::Denied);
    assert_eq!(s.renderer.success_count(), 0);
    let titles: Vec<String> = s.renderer.prompts().into_iter().map(|p| p.0).collect();
    assert!(titles.iter().all(|t| t == "Password: "));
    let processing = s
        .renderer
        .messages()
        .iter()
        .filter(|m| m.0 == PROCESSING_TITLE)
        .count();
    assert_eq!(processing, 1);
}

fn error_message_is_shown_for_a_second() {
    let mut s = session("locked");
    let started = Instant::now();

    assert_eq!(s.supervisor.run(), Verdict::Denied);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(
        s.renderer.messages(),
        vec![("Error".to_string(), "Account locked".to_string(), true)]
    );
}

fn wrong_password_is_retried_three_times() {
    let mut s = session("password");
    s.keyboard.write_all(b"x\ry\rz\rabc\r").unwrap();

    assert_eq!(s.supervisor.run(), Verdict::Denied);
    let processing = s
        .renderer
        .messages()
        .iter()
        .filter(|m| m.0 == PROCESSING_TITLE)
        .count();
    assert_eq!(processing, 3);
}

fn info_message_then_success() {
    let mut s = session("motd");
    s.keyboard.write_all(b"abc\r").unwrap();

    assert_eq!(s.supervisor.run(), Verdict::Authenticated);
    assert!(s
        .renderer
        .messages()
        .contains(&(INFO_TITLE.to_string(), "Welcome back".to_string(), false)));
}

fn missing_checker_denies() {
    let mut s = session_for(PathBuf::from("/nonexistent/lockauth-authproto"));
    assert_eq!(s.supervisor.run(), Verdict::Denied);
    assert_eq!(s.renderer.success_count(), 0);
}

fn spawn_with_stdin_closed() {
    assert_spawn_works_without(&[0]);
}

fn spawn_with_stdin_and_stdout_closed() {
    assert_spawn_works_without(&[0, 1]);
}

/// Spawn `/bin/cat` from a helper process whose `closed` descriptors are
/// free, so the new pipes land on the standard descriptors.
fn assert_spawn_works_without(closed: &[i32]) {
    // SAFETY: this binary runs its scenarios on a single thread.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            for fd in closed {
                // SAFETY: nothing in the helper uses these descriptors.
                unsafe { libc::close(*fd) };
            }
            let code = match echo_through_cat() {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("{e}");
                    1
                }
            };
            // SAFETY: leaving the forked helper without running destructors.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
        }
    }
}

fn echo_through_cat() -> Result<(), String> {
    let mut child = ChildProcess::spawn(Path::new("/bin/cat")).map_err(|e| e.to_string())?;
    {
        let (requests, responses) = child.pipes();
        write_packet(responses, PacketType::InfoMessage, b"ping").map_err(|e| e.to_string())?;
        let echoed = read_packet(requests, false).map_err(|e| e.to_string())?;
        if echoed.kind() != PacketType::InfoMessage || echoed.payload() != b"ping" {
            return Err(format!("unexpected echo: {:?}", echoed));
        }
    }
    match child.wait().map_err(|e| e.to_string())? {
        Verdict::Authenticated => Ok(()),
        other => Err(format!("cat exited with {other}")),
    }
}
