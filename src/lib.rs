// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: VM architecture, parts of the interpreter, originally in C)
// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//      (Translation to Rust)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Virtual machine and JIT compiler for eBPF programs.
//!
//! A program is loaded into an [`EbpfVm`], checked by a verifier, and can then either be run by
//! the reference interpreter or JIT-compiled to native x86-64 code and called like an ordinary
//! function. Both execution modes produce the same results for the same program and input.
//!
//! Helper functions may be registered on the VM and called from within a program with the
//! `call` instruction; they receive the values of registers r1 to r5 as arguments.

#![warn(missing_docs)]

pub mod assembler;
pub mod ebpf;
pub mod error;
pub mod helpers;
mod asm_parser;
mod interpreter;
mod jit;
mod verifier;

use crate::error::EbpfError;
pub use crate::jit::RegisterMap;
use std::ptr;

/// eBPF verification function that returns an error if the program does not meet its
/// requirements.
///
/// Some examples of things the verifier may reject the program for:
///
///   - Unknown instructions.
///   - Program does not terminate.
///   - Bad formed instruction.
///   - Jump out of the program.
pub type Verifier = fn(prog: &[u8]) -> Result<(), EbpfError>;

/// A virtual machine to run eBPF programs.
///
/// # Examples
///
/// ```
/// let prog = &[
///     0xb7, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, // mov32 r0, 42
///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
/// ];
///
/// // Instantiate a VM.
/// let vm = ebpf_jit::EbpfVm::new(Some(prog)).unwrap();
///
/// let res = vm.execute_program(&mut []).unwrap();
/// assert_eq!(res, 42);
/// ```
pub struct EbpfVm<'a> {
    prog: Option<&'a [u8]>,
    verifier: Verifier,
    jit: Option<jit::JitMemory>,
    helpers: [Option<ebpf::Helper>; ebpf::MAX_HELPERS],
    register_map: RegisterMap,
}

impl<'a> EbpfVm<'a> {
    /// Create a new virtual machine instance, and load an eBPF program into that instance.
    /// When attempting to load the program, it passes through a simple verifier.
    ///
    /// # Examples
    ///
    /// ```
    /// let prog = &[
    ///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
    /// ];
    ///
    /// // Instantiate a VM.
    /// let vm = ebpf_jit::EbpfVm::new(Some(prog)).unwrap();
    /// ```
    pub fn new(prog: Option<&'a [u8]>) -> Result<EbpfVm<'a>, EbpfError> {
        if let Some(prog) = prog {
            verifier::check(prog)?;
        }

        Ok(EbpfVm {
            prog,
            verifier: verifier::check,
            jit: None,
            helpers: [None; ebpf::MAX_HELPERS],
            register_map: RegisterMap::default(),
        })
    }

    /// Load a new eBPF program into the virtual machine instance.
    ///
    /// Any previously JIT-compiled code is dropped: it belonged to the old program.
    ///
    /// # Examples
    ///
    /// ```
    /// let prog1 = &[
    ///     0xb7, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mov32 r0, 0
    ///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
    /// ];
    /// let prog2 = &[
    ///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
    /// ];
    ///
    /// let mut vm = ebpf_jit::EbpfVm::new(Some(prog1)).unwrap();
    /// vm.set_program(prog2).unwrap();
    /// ```
    pub fn set_program(&mut self, prog: &'a [u8]) -> Result<(), EbpfError> {
        (self.verifier)(prog)?;
        self.prog = Some(prog);
        self.jit = None;
        Ok(())
    }

    /// Set a new verifier function. The function should return an `EbpfError` if the program
    /// should be rejected by the virtual machine. If a program has been loaded to the VM
    /// already, the verifier is immediately run.
    pub fn set_verifier(&mut self, verifier: Verifier) -> Result<(), EbpfError> {
        if let Some(prog) = self.prog {
            verifier(prog)?;
        }
        self.verifier = verifier;
        Ok(())
    }

    /// Swap the register assignment the JIT compiler works with for a permuted one, derived
    /// with [`RegisterMap::with_offset`]. This is a testing hook: any permutation must compile
    /// to an observably equivalent program.
    ///
    /// Fails if the program has already been JIT-compiled, since the compiled code embeds the
    /// previous assignment.
    pub fn set_register_offset(&mut self, offset: u32) -> Result<(), EbpfError> {
        if self.jit.is_some() {
            return Err(EbpfError::JitAlreadyCompiled);
        }
        self.register_map = RegisterMap::with_offset(offset);
        Ok(())
    }

    /// Register a helper function in order to use it later from within the eBPF program. The
    /// helper is stored in a table indexed by the immediate of the `call` instruction.
    ///
    /// If using JIT-compiled eBPF programs, be sure to register all helpers before compiling
    /// the program: the compiled code embeds their addresses.
    ///
    /// # Examples
    ///
    /// ```
    /// use ebpf_jit::helpers;
    ///
    /// let prog = &[
    ///     0xb7, 0x01, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00, // mov32 r1, 400
    ///     0x85, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, // call 1
    ///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
    /// ];
    ///
    /// let mut vm = ebpf_jit::EbpfVm::new(Some(prog)).unwrap();
    ///
    /// // Register a helper. This helper computes the square root of its first argument, so
    /// // the program returns 20.
    /// vm.register_helper(1, helpers::sqrti).unwrap();
    ///
    /// let res = vm.execute_program(&mut []).unwrap();
    /// assert_eq!(res, 20);
    /// ```
    pub fn register_helper(
        &mut self,
        key: usize,
        function: ebpf::Helper,
    ) -> Result<(), EbpfError> {
        if key >= ebpf::MAX_HELPERS {
            return Err(EbpfError::HelperOutOfBounds(key, ebpf::MAX_HELPERS));
        }
        self.helpers[key] = Some(function);
        Ok(())
    }

    /// Execute the program loaded with the interpreter, with the given input memory.
    ///
    /// The pointer to the memory is made available to the program in register r1; an empty
    /// slice leaves r1 at zero.
    ///
    /// # Examples
    ///
    /// ```
    /// let prog = &[
    ///     0x71, 0x10, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, // ldxb r0, [r1+2]
    ///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
    /// ];
    /// let mem = &mut [
    ///     0xaa, 0xbb, 0x11, 0x22, 0xcc, 0xdd
    /// ];
    ///
    /// let vm = ebpf_jit::EbpfVm::new(Some(prog)).unwrap();
    ///
    /// let res = vm.execute_program(mem).unwrap();
    /// assert_eq!(res, 0x11);
    /// ```
    pub fn execute_program(&self, mem: &mut [u8]) -> Result<u64, EbpfError> {
        let prog = self.prog.ok_or(EbpfError::NothingToExecute)?;
        interpreter::execute_program(prog, mem, &self.helpers)
    }

    /// JIT-compile the loaded program to native code.
    ///
    /// Compiling an already-compiled VM is a no-op that keeps the existing code and entry
    /// point. All helpers the program calls must have been registered beforehand.
    ///
    /// # Examples
    ///
    /// ```
    /// let prog = &[
    ///     0xb7, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, // mov32 r0, 42
    ///     0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00  // exit
    /// ];
    ///
    /// let mut vm = ebpf_jit::EbpfVm::new(Some(prog)).unwrap();
    /// vm.jit_compile().unwrap();
    ///
    /// let res = unsafe { vm.execute_program_jit(&mut []).unwrap() };
    /// assert_eq!(res, 42);
    /// ```
    pub fn jit_compile(&mut self) -> Result<(), EbpfError> {
        let prog = self.prog.ok_or(EbpfError::NothingToExecute)?;
        if self.jit.is_some() {
            return Ok(());
        }
        self.jit = Some(jit::JitMemory::new(prog, &self.helpers, &self.register_map)?);
        Ok(())
    }

    /// Base address and length of the compiled code, if the program has been JIT-compiled.
    /// The base address is the entry point of the compiled function.
    pub fn get_jitted_code(&self) -> Option<(*const u8, usize)> {
        self.jit.as_ref().map(|jit| (jit.as_ptr(), jit.size()))
    }

    /// Execute the previously JIT-compiled program, with the given input memory, in a manner
    /// very similar to [`execute_program`](EbpfVm::execute_program).
    ///
    /// # Safety
    ///
    /// **WARNING:** JIT-compiled assembly code is not safe. It may be wise to check that the
    /// program works with the interpreter before running the JIT-compiled version of it.
    /// Memory accesses of the program are not checked at runtime: the verifier and the
    /// program's own discipline are the only guards.
    pub unsafe fn execute_program_jit(&self, mem: &mut [u8]) -> Result<u64, EbpfError> {
        let prog_fn = self.jit.as_ref().ok_or(EbpfError::JitNotCompiled)?.get_prog();
        let ctx = if mem.is_empty() {
            ptr::null_mut()
        } else {
            mem.as_mut_ptr()
        };
        Ok(prog_fn(ctx))
    }
}
