//! classjit CLI.
//!
//! ```bash
//! # Run a class file under the reference interpreter
//! classjit interpret Test.class
//!
//! # Dump the SSA for each method
//! classjit ssa Test.class
//!
//! # Compile: write raw code bytes, or JIT and run main
//! classjit compile Test.class Test.bin
//! classjit compile Test.class
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "classjit",
    version,
    about = "AOT x86-64 compiler and interpreter for a JVM class-file subset"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a class file under the reference interpreter
    Interpret {
        /// Input class file
        input: PathBuf,
    },
    /// Print the SSA for each method
    Ssa {
        /// Input class file
        input: PathBuf,
    },
    /// Compile to native code; write raw bytes to a file, or JIT and run
    /// main when no output path is given
    Compile {
        /// Input class file
        input: PathBuf,
        /// Output file for the raw code bytes
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match args.command {
        Command::Interpret { input } => {
            let cls = load_class(&input)?;
            let mut stdout = std::io::stdout().lock();
            classjit::Interpreter::new(&cls).run(&mut stdout)?;
        }

        Command::Ssa { input } => {
            let cls = load_class(&input)?;
            let ssa = classjit::compile_to_ssa(&cls)?;
            println!("{}", ssa);
        }

        Command::Compile { input, output } => {
            let cls = load_class(&input)?;
            let compiled = classjit::compile(&cls)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &compiled.code)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                }
                None => run_jit(&compiled)?,
            }
        }
    }
    Ok(())
}

fn load_class(path: &Path) -> Result<classjit::ClassFile> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let cls = classjit::ClassFile::parse(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(cls)
}

#[cfg(all(target_arch = "x86_64", unix))]
fn run_jit(compiled: &classjit::CompiledProgram) -> Result<()> {
    let buffer = classjit::runtime::ExecBuffer::new(&compiled.code)?;
    unsafe { buffer.call(compiled.entry) };
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
fn run_jit(_compiled: &classjit::CompiledProgram) -> Result<()> {
    anyhow::bail!("JIT execution is only supported on x86-64 unix hosts; pass an output file")
}
