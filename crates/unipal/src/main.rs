use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use unipal_core::launch::{LaunchRequest, CREATE_NEW_CONSOLE, CREATE_SUSPENDED};
use unipal_core::types::ProcessId;
use unipal_core::{
    create_process, get_process_status, process_context, terminate_process, DumpConfig, DumpType, ProcessState,
};
use unipal_utils::{info, init_logging};

/// Windows-style process lifecycle host over POSIX.
#[derive(Parser, Debug)]
#[command(name = "unipal")]
#[command(version)]
#[command(about = "Launch, observe and terminate processes with CreateProcess semantics", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Launch a program and wait for it, propagating its exit code
    Run
    {
        /// Path to the executable to launch
        program: String,
        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Start the child suspended and resume it immediately after
        /// launch (exercises the suspended-start wake pipe)
        #[arg(long, default_value_t = false)]
        suspended: bool,
        /// Ask for a new console (accepted and ignored, as on the
        /// original API surface)
        #[arg(long, default_value_t = false)]
        new_console: bool,
        /// Working directory for the child
        #[arg(long)]
        cwd: Option<String>,
        /// Environment entries (KEY=VALUE); replaces the inherited
        /// environment when given
        #[arg(long = "env")]
        env: Vec<String>,
    },
    /// Query the state and exit code of a process once
    Status
    {
        /// Process ID (PID) to query
        pid: u32,
    },
    /// Kill a process the TerminateProcess way (SIGKILL)
    Kill
    {
        /// Process ID (PID) to kill
        pid: u32,
    },
    /// Generate a core dump of this process with the dump utility
    Dump
    {
        /// Dump file name passed to the utility
        #[arg(long)]
        name: Option<String>,
        /// Dump kind: normal, withheap, triage or full
        #[arg(long, default_value = "normal")]
        dump_type: DumpType,
    },
    /// Run the debugger startup handshake and report whether a debugger
    /// was waiting
    Notify,
}

fn main()
{
    // Initialize logging (reads from RUST_LOG env var)
    // Defaults to INFO level and Pretty format if not set
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    // Arm the crash dump pipeline if UNIPAL_ENABLE_DUMP is set.
    if !unipal_core::dump::abort_initialize(&DumpConfig::from_env()) {
        eprintln!("Failed to configure crash dumps");
        process::exit(1);
    }

    let cli = Cli::parse();

    match run_command(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_command(cli: Cli) -> Result<i32, Box<dyn std::error::Error>>
{
    match cli.command {
        Commands::Run {
            program,
            args,
            suspended,
            new_console,
            cwd,
            env,
        } => {
            info!("launching {} with args {:?}", program, args);

            let mut argv = vec![program];
            argv.extend(args);

            let mut flags = 0;
            if suspended {
                flags |= CREATE_SUSPENDED;
            }
            if new_console {
                flags |= CREATE_NEW_CONSOLE;
            }

            let mut request = LaunchRequest::new(argv);
            request.creation_flags = flags;
            request.current_directory = cwd.map(std::path::PathBuf::from);
            if !env.is_empty() {
                request.environment = Some(env);
            }

            let mut launched = create_process(&request)?;
            println!("Launched pid {}", launched.pid);

            if launched.thread.is_suspended() {
                launched.thread.resume()?;
            }

            let code = wait_for_exit(&launched.process)?;
            Ok(code as i32)
        }
        Commands::Status { pid } => {
            let handle = process_context().registry().open_by_pid(ProcessId(pid))?;
            let (state, code) = get_process_status(&handle)?;
            match state {
                ProcessState::Running => println!("pid {} is running", pid),
                ProcessState::Done => println!("pid {} is done, exit code {}", pid, code),
            }
            Ok(0)
        }
        Commands::Kill { pid } => {
            let handle = process_context().registry().open_by_pid(ProcessId(pid))?;
            terminate_process(&handle, 0)?;
            println!("Killed pid {}", pid);
            Ok(0)
        }
        Commands::Dump { name, dump_type } => {
            let config = DumpConfig {
                enabled: true,
                name,
                dump_type: Some(dump_type),
                ..DumpConfig::default()
            };
            if unipal_core::dump::generate_core_dump(&config, None) {
                println!("Dump written");
                Ok(0)
            } else {
                Err("dump generation failed".into())
            }
        }
        Commands::Notify => {
            if unipal_core::handshake::notify_runtime_started() {
                println!("Launched by a debugger; continue received");
            } else {
                println!("No debugger waiting");
            }
            Ok(0)
        }
    }
}

/// Poll a launched child until it finishes.
///
/// The status query is deliberately non-blocking (WNOHANG underneath), so
/// waiting is a poll loop rather than a blocking wait.
fn wait_for_exit(handle: &unipal_core::ProcessHandle) -> Result<u32, Box<dyn std::error::Error>>
{
    loop {
        let (state, code) = get_process_status(handle)?;
        if state == ProcessState::Done {
            return Ok(code);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
