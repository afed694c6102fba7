//! Runtime support for generated code.
//!
//! Generated code reaches the host through five print helpers invoked by
//! absolute address. The emitted call sequence is `push arg; mov rcx,
//! imm64; call rcx; add rsp, 8`, so each helper receives its argument on
//! the stack at `[rsp + 8]`, not in a register. The helpers are therefore
//! naked shims: they move the stack argument into rdi, realign rsp (call
//! sites with an odd argument count enter with rsp ≡ 0 mod 16), and call a
//! normal `sysv64` implementation.
//!
//! [`ExecBuffer`] owns the executable mapping for JIT runs: an anonymous
//! read-write mapping that is flipped to read-execute once the code is
//! copied in.

use crate::jir::StandardKind;
use std::io::Write;

/// Absolute address of the helper for a standard call, as baked into
/// generated code.
#[cfg(target_arch = "x86_64")]
pub fn helper_address(kind: StandardKind) -> u64 {
    let f: unsafe extern "C" fn() = match kind {
        StandardKind::PrintInt => print_int_shim,
        StandardKind::PrintChar => print_char_shim,
        StandardKind::PrintlnInt => println_int_shim,
        StandardKind::PrintlnChar => println_char_shim,
        StandardKind::PrintlnVoid => println_void_shim,
    };
    f as usize as u64
}

/// Placeholder for non-x86-64 builds, where generated code can be written
/// out but never executed.
#[cfg(not(target_arch = "x86_64"))]
pub fn helper_address(_kind: StandardKind) -> u64 {
    0
}

extern "sysv64" fn print_int_impl(value: i32) {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "{}", value);
    let _ = out.flush();
}

extern "sysv64" fn print_char_impl(value: i32) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(&[value as u8]);
    let _ = out.flush();
}

extern "sysv64" fn println_int_impl(value: i32) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", value);
    let _ = out.flush();
}

extern "sysv64" fn println_char_impl(value: i32) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(&[value as u8, b'\n']);
    let _ = out.flush();
}

extern "sysv64" fn println_void_impl() {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(b"\n");
    let _ = out.flush();
}

/// Shim for a one-argument helper: fetch the stack argument, realign, and
/// call the real implementation.
#[cfg(target_arch = "x86_64")]
macro_rules! arg_shim {
    ($shim:ident, $impl:ident) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $shim() {
            core::arch::naked_asm!(
                "mov rdi, qword ptr [rsp + 8]",
                "push rbp",
                "mov rbp, rsp",
                "and rsp, -16",
                "call {imp}",
                "mov rsp, rbp",
                "pop rbp",
                "ret",
                imp = sym $impl,
            );
        }
    };
}

#[cfg(target_arch = "x86_64")]
arg_shim!(print_int_shim, print_int_impl);
#[cfg(target_arch = "x86_64")]
arg_shim!(print_char_shim, print_char_impl);
#[cfg(target_arch = "x86_64")]
arg_shim!(println_int_shim, println_int_impl);
#[cfg(target_arch = "x86_64")]
arg_shim!(println_char_shim, println_char_impl);

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn println_void_shim() {
    core::arch::naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {imp}",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
        imp = sym println_void_impl,
    );
}

/// An executable mapping holding assembled code.
#[cfg(all(target_arch = "x86_64", unix))]
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
}

#[cfg(all(target_arch = "x86_64", unix))]
impl ExecBuffer {
    /// Map `code` into fresh executable memory.
    pub fn new(code: &[u8]) -> anyhow::Result<Self> {
        use anyhow::{bail, Context};

        if code.is_empty() {
            bail!("cannot map empty code buffer");
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = usize::try_from(page).context("querying page size")?;
        let len = code.len().div_ceil(page) * page;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!("mmap failed: {}", std::io::Error::last_os_error());
        }
        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) != 0
            {
                let err = std::io::Error::last_os_error();
                libc::munmap(ptr as *mut libc::c_void, len);
                bail!("mprotect failed: {}", err);
            }
        }

        Ok(Self { ptr, len })
    }

    /// Address of the code at byte `offset`.
    pub fn entry(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.len);
        unsafe { self.ptr.add(offset) }
    }

    /// Call into the buffer at `offset` as a zero-argument function.
    ///
    /// # Safety
    ///
    /// `offset` must be the entry of a function assembled by this crate's
    /// pipeline; the generated code clobbers callee-saved registers, which
    /// the trampoline saves and restores.
    pub unsafe fn call(&self, offset: usize) {
        let entry = self.entry(offset);
        unsafe {
            std::arch::asm!(
                "push rbx",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "push rbp",
                "mov rbp, rsp",
                "and rsp, -16",
                "call rax",
                "mov rsp, rbp",
                "pop rbp",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop rbx",
                inlateout("rax") entry => _,
                clobber_abi("sysv64"),
            );
        }
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}
