//! End-to-end launch, status and termination tests against real child
//! processes.

use std::time::{Duration, Instant};

use unipal_core::launch::{FileHandle, LaunchRequest, StdioRedirect, CREATE_SUSPENDED};
use unipal_core::{
    create_process, get_exit_code, get_process_status, terminate_process, PalError, ProcessState, STILL_ACTIVE,
};

/// Poll a handle until the process reports done.
fn wait_done(handle: &unipal_core::ProcessHandle) -> u32
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let (state, code) = get_process_status(handle).expect("status query");
        if state == ProcessState::Done {
            return code;
        }
        assert!(Instant::now() < deadline, "child did not finish in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn shell(script: &str) -> LaunchRequest
{
    LaunchRequest::new(["/bin/sh", "-c", script])
}

#[test]
fn true_exits_zero()
{
    let launched = create_process(&LaunchRequest::new(["/bin/true"])).expect("launch");
    assert_eq!(wait_done(&launched.process), 0);
}

#[test]
fn exit_code_propagates()
{
    let launched = create_process(&shell("exit 42")).expect("launch");
    assert_eq!(wait_done(&launched.process), 42);
}

#[test]
fn missing_executable_is_file_not_found()
{
    let err = create_process(&LaunchRequest::new(["/definitely/not/here"])).unwrap_err();
    assert!(matches!(err, PalError::FileNotFound(_)));
}

#[test]
fn directory_is_access_denied()
{
    let err = create_process(&LaunchRequest::new(["/tmp"])).unwrap_err();
    assert!(matches!(err, PalError::AccessDenied(_)));
}

#[test]
fn running_process_reports_still_active_then_kill_code()
{
    let launched = create_process(&LaunchRequest::new(["/bin/sleep", "30"])).expect("launch");

    assert_eq!(get_exit_code(&launched.process).unwrap(), STILL_ACTIVE);

    terminate_process(&launched.process, 0).expect("kill");
    let code = wait_done(&launched.process);
    assert_eq!(code, 128 + libc::SIGKILL as u32);

    // The answer is cached and stays identical on re-query.
    assert_eq!(get_process_status(&launched.process).unwrap(), (ProcessState::Done, code));
    assert_eq!(get_exit_code(&launched.process).unwrap(), code);
}

#[test]
fn suspended_start_waits_for_resume()
{
    let mut request = shell("exit 7");
    request.creation_flags = CREATE_SUSPENDED;
    let mut launched = create_process(&request).expect("launch");
    assert!(launched.thread.is_suspended());

    // The child must still be parked on the wake pipe.
    std::thread::sleep(Duration::from_millis(50));
    let (state, _) = get_process_status(&launched.process).unwrap();
    assert_eq!(state, ProcessState::Running);

    launched.thread.resume().expect("resume");
    assert!(!launched.thread.is_suspended());
    assert_eq!(wait_done(&launched.process), 7);

    // Resuming again is a no-op.
    launched.thread.resume().expect("second resume");
}

#[test]
fn discarded_suspension_is_fatal_to_the_child()
{
    let mut request = LaunchRequest::new(["/bin/true"]);
    request.creation_flags = CREATE_SUSPENDED;
    let launched = create_process(&request).expect("launch");

    // Dropping the unresumed thread handle closes the wake pipe; the child
    // sees end-of-file instead of the wake byte and dies.
    drop(launched.thread);
    assert_eq!(wait_done(&launched.process), libc::EXIT_FAILURE as u32);
}

#[test]
fn environment_block_reaches_the_child()
{
    let mut request = shell("test \"$FOO\" = bar");
    request.environment = Some(vec!["FOO=bar".to_string()]);
    let launched = create_process(&request).expect("launch");
    assert_eq!(wait_done(&launched.process), 0);

    let mut request = shell("test \"$FOO\" = bar");
    request.environment = Some(vec!["FOO=other".to_string()]);
    let launched = create_process(&request).expect("launch");
    assert_eq!(wait_done(&launched.process), 1);
}

#[test]
fn working_directory_applies_before_exec()
{
    let mut request = shell("test \"$(pwd)\" = /");
    request.current_directory = Some("/".into());
    let launched = create_process(&request).expect("launch");
    assert_eq!(wait_done(&launched.process), 0);
}

#[test]
fn stdout_redirection_lands_in_the_file()
{
    use std::os::fd::AsRawFd;

    let dir = std::env::temp_dir();
    let out_path = dir.join(format!("unipal-stdout-{}", std::process::id()));

    let devnull = std::fs::File::open("/dev/null").expect("open /dev/null");
    let out = std::fs::File::create(&out_path).expect("create out file");
    let err = std::fs::File::create(dir.join(format!("unipal-stderr-{}", std::process::id()))).expect("create err file");

    let mut request = shell("echo hello");
    request.stdio = Some(StdioRedirect {
        stdin: FileHandle::inheritable(devnull.as_raw_fd()),
        stdout: FileHandle::inheritable(out.as_raw_fd()),
        stderr: FileHandle::inheritable(err.as_raw_fd()),
    });

    let launched = create_process(&request).expect("launch");
    assert_eq!(wait_done(&launched.process), 0);

    let contents = std::fs::read_to_string(&out_path).expect("read redirected output");
    assert_eq!(contents, "hello\n");

    let _ = std::fs::remove_file(&out_path);
    let _ = std::fs::remove_file(dir.join(format!("unipal-stderr-{}", std::process::id())));
}

#[test]
fn non_inheritable_handle_is_rejected()
{
    use std::os::fd::AsRawFd;

    let devnull = std::fs::File::open("/dev/null").expect("open /dev/null");

    let mut request = shell("true");
    request.stdio = Some(StdioRedirect {
        stdin: FileHandle::private(devnull.as_raw_fd()),
        stdout: FileHandle::inheritable(1),
        stderr: FileHandle::inheritable(2),
    });

    let err = create_process(&request).unwrap_err();
    assert!(matches!(err, PalError::InvalidHandle(_)));
}
