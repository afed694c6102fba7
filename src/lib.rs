//! classjit: AOT x86-64 compiler and reference interpreter for a subset
//! of the JVM class-file format.
//!
//! # Architecture
//!
//! The compiler is a one-way pipeline over a single class file:
//!
//! ```text
//! .class bytes
//!      │ (classfile)
//!      ▼
//! ┌─────────────┐
//! │  Linear IR  │  explicit stack/local pseudo-variables
//! └──────┬──────┘
//!        │ (ssa::build + dominance-frontier φ insertion)
//!        ▼
//! ┌─────────────┐
//! │     SSA     │  copy propagation + dead-code elimination
//! └──────┬──────┘
//!        │ (regalloc: Chaitin coloring, iterative spilling)
//!        ▼
//! ┌─────────────┐
//! │ Machine IR  │  x86-64 three-address code, symbolic targets
//! └──────┬──────┘
//!        │ (x64::Assembler)
//!        ▼
//! code bytes + rel32 fixups
//! ```
//!
//! The byte buffer can be written to a file or mapped executable and run
//! in-process (see [`runtime::ExecBuffer`]). A reference interpreter over
//! the same bytecode subset lives in [`interp`].
//!
//! # Example
//!
//! ```ignore
//! let data = std::fs::read("Test.class")?;
//! let cls = classjit::classfile::ClassFile::parse(&data)?;
//! let compiled = classjit::compile(&cls)?;
//! std::fs::write("Test.bin", &compiled.code)?;
//! ```

pub mod classfile;
pub mod interp;
pub mod jir;
pub mod regalloc;
pub mod runtime;
pub mod ssa;
pub mod x64;

pub use classfile::ClassFile;
pub use interp::Interpreter;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use log::debug;

/// The output of a full compilation.
#[derive(Debug)]
pub struct CompiledProgram {
    /// Raw code bytes (flat, no header).
    pub code: Vec<u8>,
    /// Byte offset of `main`.
    pub entry: usize,
    /// Byte offset of each function, in program order.
    pub function_offsets: IndexMap<String, usize>,
}

/// Compile a class file to x86-64 machine code.
pub fn compile(cls: &ClassFile) -> Result<CompiledProgram> {
    let mut ssa_prog = build_ssa(cls)?;

    let machine = x64::build_program(&mut ssa_prog).context("lowering SSA to machine code")?;
    let mut assembler = x64::Assembler::new(&machine);
    assembler.assemble().context("assembling machine code")?;

    let mut function_offsets = IndexMap::new();
    for (i, func) in machine.functions.iter().enumerate() {
        function_offsets.insert(func.name.clone(), assembler.function_offset(i)?);
    }
    let entry = *function_offsets
        .get("main")
        .ok_or_else(|| anyhow!("Could not find main() method"))?;

    let code = assembler.into_code();
    debug!("assembled {} bytes, entry at {:#x}", code.len(), entry);

    Ok(CompiledProgram { code, entry, function_offsets })
}

/// Build and simplify the SSA for a class file (the `ssa` subcommand).
pub fn compile_to_ssa(cls: &ClassFile) -> Result<ssa::Program> {
    build_ssa(cls)
}

fn build_ssa(cls: &ClassFile) -> Result<ssa::Program> {
    let jprog = jir::build_program(cls).context("lowering bytecode")?;
    let mut ssa_prog = ssa::build_program(&jprog).context("constructing SSA")?;
    for func in &mut ssa_prog.functions {
        ssa::simplify(func);
    }
    Ok(ssa_prog)
}
