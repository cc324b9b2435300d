//! # jvm-rs
//!
//! The execution core of a JVM-style bytecode interpreter: tagged operand
//! stacks and locals, frames, the dispatch loop, exception unwinding,
//! monitors, native calls, safe points and debugger hooks.
//!
//! Class loading, heap management and synchronization are collaborators
//! behind traits; [`resolve::ClassRegistry`], [`value::object::Heap`] and
//! [`vm::SyncBlockManager`] are the in-process implementations.
use clap::{Parser, ValueEnum};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

pub mod assembler;
pub mod demos;
pub mod error;
pub mod resolve;
pub mod types;
pub mod value;
#[macro_use]
pub mod vm;

use demos::Program;
use value::{object::Heap, AddressingMode, Compressed, Switchable, Uncompressed};
use vm::{ExecutionResult, InterpreterConfig};

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum Addressing {
    Uncompressed,
    #[default]
    Compressed,
    /// Compressed when the heap fits, decided once at startup.
    Switchable,
}

impl From<Addressing> for AddressingMode {
    fn from(value: Addressing) -> Self {
        match value {
            Addressing::Uncompressed => Uncompressed.into(),
            Addressing::Compressed => Compressed::default().into(),
            Addressing::Switchable => Switchable::detect(Heap::new().limit()).into(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs built-in programs on a JVM-style bytecode interpreter"
)]
pub struct Args {
    #[arg(value_enum)]
    pub program: Program,
    #[arg(value_name = "N", allow_negative_numbers = true)]
    pub input: i32,
    #[arg(short, long, value_enum, default_value_t)]
    pub addressing: Addressing,
    /// Print the bytecode of the demo class before running.
    #[arg(short, long)]
    pub disassemble: bool,
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("JVM_RS_LOG"))
        .with_writer(std::io::stderr)
        .init();

    if args.disassemble {
        if let Err(e) = print_disassembly() {
            eprintln!("Error building demo class: {}", e);
            return ExitCode::from(1);
        }
    }

    let config = InterpreterConfig {
        addressing: args.addressing.into(),
        ..InterpreterConfig::default()
    };
    match demos::run(args.program, args.input, config) {
        Ok(ExecutionResult::Returned(Some(v))) => {
            println!("{:?}", v);
            ExitCode::SUCCESS
        }
        Ok(ExecutionResult::Returned(None)) => ExitCode::SUCCESS,
        Ok(ExecutionResult::Threw(e)) => {
            eprintln!("Unhandled exception {:?}", e);
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("Error building demo class: {}", e);
            ExitCode::from(1)
        }
    }
}

fn print_disassembly() -> Result<(), error::ProgramError> {
    use resolve::Resolver;

    let registry = resolve::ClassRegistry::new();
    let class = registry.class(demos::define(&registry)?);
    for method in class.methods.iter().map(|m| registry.method(*m)) {
        println!("{:?}", method);
        if let Some(code) = &method.code {
            for (pc, mnemonic) in vm::opcodes::disassemble(&code.bytecode) {
                println!("  {pc:4}: {mnemonic}");
            }
        }
    }
    Ok(())
}
