use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod vm;

use config::RuntimeConfig;
use vm::{load_unit, Interpreter, VmError};

#[derive(Parser)]
#[command(name = "conch")]
#[command(about = "A bytecode virtual machine for a small shell language", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compiled conch unit file
    Run {
        /// The unit file to run
        file: PathBuf,
        /// Call-stack capacity in bytes
        #[arg(long)]
        stack_size: Option<usize>,
        /// Disable collection on heap growth
        #[arg(long)]
        no_gc: bool,
        /// Trace collection cycles on stderr
        #[arg(long)]
        trace_gc: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            stack_size,
            no_gc,
            trace_gc,
        } => {
            let mut config = RuntimeConfig::default();
            if let Some(capacity) = stack_size {
                config.call_stack_capacity = capacity;
            }
            config.gc_enabled = !no_gc;
            config.trace_gc = trace_gc;

            match run_file(&file, &config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(RunError::Io(message)) => {
                    eprintln!("{}", message);
                    ExitCode::FAILURE
                }
                Err(RunError::Vm(VmError::RuntimeException(message))) => {
                    eprintln!("panic: {}", message);
                    ExitCode::from(vm::process::PANIC as u8)
                }
                Err(RunError::Vm(err)) => {
                    eprintln!("{}: {}", err.name(), err);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

enum RunError {
    Io(String),
    Vm(VmError),
}

fn run_file(path: &PathBuf, config: &RuntimeConfig) -> Result<(), RunError> {
    let bytes = std::fs::read(path).map_err(|err| {
        RunError::Io(format!(
            "error: could not read file '{}': {}",
            path.display(),
            err
        ))
    })?;

    let mut interpreter = Interpreter::new(config);
    let unit = load_unit(&bytes, interpreter.heap_mut()).map_err(RunError::Vm)?;
    interpreter.run(&unit).map_err(RunError::Vm)?;
    Ok(())
}
