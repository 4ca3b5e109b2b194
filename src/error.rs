// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error definitions for the virtual machine, the verifier and the JIT compiler.

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EbpfError {
    /// No program set on the VM
    #[error("no program set, call set_program() first")]
    NothingToExecute,
    /// Program has not been JIT-compiled
    #[error("program has not been JIT-compiled")]
    JitNotCompiled,
    /// Attempt to swap the register map after compilation
    #[error("register map cannot change once the program is JIT-compiled")]
    JitAlreadyCompiled,
    /// Unknown eBPF opcode reached the JIT compiler
    #[error("unknown opcode {0:#04x} at PC {1}")]
    UnknownOpCode(u8, usize),
    /// The CALL immediate does not name a registered helper
    #[error("unknown helper function (id: {0:#x}) at PC {1}")]
    UnknownHelper(u32, usize),
    /// Helper index outside the helper table
    #[error("helper index {0} is out of bounds (max {1})")]
    HelperOutOfBounds(usize, usize),
    /// A libc call the JIT depends on failed
    #[error("libc function {0} failed with errno {1}")]
    LibcInvocationFailed(&'static str, i32),
    /// Execution ran past the end of the program
    #[error("attempted to execute past the end of the program at instruction #{0}")]
    ExecutionOverrun(usize),

    // Verifier rejections.
    /// Program is empty
    #[error("no program to verify")]
    EmptyProgram,
    /// Program length is not a multiple of the instruction size
    #[error("program length must be a multiple of 8 octets")]
    InvalidProgramLength,
    /// Program is longer than the maximum allowed
    #[error("program is too long ({0} instructions)")]
    ProgramTooLong(usize),
    /// Program does not end with the EXIT instruction
    #[error("program does not end with the exit instruction")]
    NoExitAtEnd,
    /// Unknown opcode found during verification
    #[error("unknown opcode {0:#04x} at instruction #{1}")]
    VerifierUnknownOpCode(u8, usize),
    /// Register operand out of range
    #[error("invalid register {0} at instruction #{1}")]
    InvalidRegister(u8, usize),
    /// Write to the read-only frame pointer register
    #[error("cannot write into register r10 at instruction #{0}")]
    CannotWriteR10(usize),
    /// Division or modulo by a zero immediate
    #[error("division by 0 at instruction #{0}")]
    DivisionByZero(usize),
    /// LE or BE with a width other than 16, 32 or 64
    #[error("unsupported argument for LE/BE at instruction #{0}")]
    UnsupportedLeBeArgument(usize),
    /// Shift with an immediate out of range for the operand width
    #[error("invalid shift amount {0} at instruction #{1}")]
    InvalidShiftAmount(i32, usize),
    /// lddw is missing its second instruction slot
    #[error("incomplete lddw at instruction #{0}")]
    IncompleteLddw(usize),
    /// Jump to an address outside the program
    #[error("jump out of code to #{0} at instruction #{1}")]
    JumpOutOfCode(isize, usize),
    /// Jump into the second slot of an lddw
    #[error("jump to the middle of an lddw at instruction #{0}")]
    JumpToMiddleOfLddw(usize),
}
