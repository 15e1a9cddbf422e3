//! Crash-guard and dump-execution tests.
//!
//! The crash guard is claimed once per process lifetime and a losing
//! thread parks forever, so every `serialize = true` call in this binary
//! lives in a single test on a single thread.

use std::ffi::CString;

use unipal_core::dump::{create_crash_dump, generate_core_dump, DumpConfig};

fn cstrings(args: &[&str]) -> Vec<CString>
{
    args.iter().map(|a| CString::new(*a).unwrap()).collect()
}

#[test]
fn guard_claims_once_and_refuses_reentry()
{
    let argv = cstrings(&["/bin/true"]);

    // First claim wins and the dump command (a stand-in utility) succeeds.
    assert!(create_crash_dump(&argv, None, true));

    // Same thread coming back is refused immediately instead of parked.
    assert!(!create_crash_dump(&argv, None, true));
}

#[test]
fn nonzero_utility_exit_is_a_failure()
{
    let argv = cstrings(&["/bin/false"]);
    assert!(!create_crash_dump(&argv, None, false));
}

#[test]
fn utility_stderr_is_captured_into_the_buffer()
{
    let argv = cstrings(&["/bin/sh", "-c", "echo oops >&2; exit 3"]);
    let mut buffer = [0u8; 256];

    assert!(!create_crash_dump(&argv, Some(&mut buffer), false));

    let text = String::from_utf8_lossy(&buffer);
    assert!(text.contains("oops"), "captured: {text}");
}

#[test]
fn missing_dump_utility_fails_cleanly()
{
    let config = DumpConfig {
        enabled: true,
        runtime_dir: Some("/definitely/not/here".into()),
        ..DumpConfig::default()
    };
    assert!(!generate_core_dump(&config, None));
}
