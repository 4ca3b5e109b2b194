// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: safety checks, originally in C)
// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//      (Translation to Rust)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! This module provides a simple eBPF verifier.
//!
//! The verifier rejects obviously malformed programs before they reach the interpreter or the
//! JIT compiler, both of which assume their input is valid. Contrary to the checker of the Linux
//! kernel it does not perform register state tracking: it checks the program structure only.
//!
//! Things the verifier rejects a program for:
//!
//! - Unknown instructions.
//! - Program not ending with the `exit` instruction.
//! - Out-of-range register operands, or writes to the frame pointer r10.
//! - Division or modulo by a zero immediate.
//! - Jumps out of the program, or into the second slot of an `lddw`.

use crate::{ebpf, error::EbpfError};

fn check_prog_len(prog: &[u8]) -> Result<(), EbpfError> {
    if prog.len() % ebpf::INSN_SIZE != 0 {
        return Err(EbpfError::InvalidProgramLength);
    }
    if prog.len() > ebpf::PROG_MAX_SIZE {
        return Err(EbpfError::ProgramTooLong(prog.len() / ebpf::INSN_SIZE));
    }
    if prog.is_empty() {
        return Err(EbpfError::EmptyProgram);
    }
    let last_insn = ebpf::get_insn(prog, (prog.len() / ebpf::INSN_SIZE) - 1);
    if last_insn.opc != ebpf::EXIT {
        return Err(EbpfError::NoExitAtEnd);
    }
    Ok(())
}

fn check_imm_endian(insn: &ebpf::Insn, insn_ptr: usize) -> Result<(), EbpfError> {
    match insn.imm {
        16 | 32 | 64 => Ok(()),
        _ => Err(EbpfError::UnsupportedLeBeArgument(insn_ptr)),
    }
}

fn check_shift_imm(insn: &ebpf::Insn, insn_ptr: usize, width: i32) -> Result<(), EbpfError> {
    if insn.imm < 0 || insn.imm >= width {
        return Err(EbpfError::InvalidShiftAmount(insn.imm, insn_ptr));
    }
    Ok(())
}

fn check_registers(insn: &ebpf::Insn, store: bool, insn_ptr: usize) -> Result<(), EbpfError> {
    if insn.src > 10 {
        return Err(EbpfError::InvalidRegister(insn.src, insn_ptr));
    }
    match (insn.dst, store) {
        (0..=9, _) | (10, true) => Ok(()),
        (10, false) => Err(EbpfError::CannotWriteR10(insn_ptr)),
        (r, _) => Err(EbpfError::InvalidRegister(r, insn_ptr)),
    }
}

/// Check a program against the structural rules listed in the module documentation, and return
/// an `EbpfError` naming the offending instruction if one of them is violated.
pub fn check(prog: &[u8]) -> Result<(), EbpfError> {
    check_prog_len(prog)?;

    let num_insns = prog.len() / ebpf::INSN_SIZE;
    // Second slots of lddw instructions are data, not code: jumps may not land on them.
    let mut lddw_data_slot = vec![false; num_insns];
    let mut jumps: Vec<(usize, i16)> = vec![];

    let mut insn_ptr: usize = 0;
    while insn_ptr < num_insns {
        let insn = ebpf::get_insn(prog, insn_ptr);
        let mut store = false;

        match insn.opc {
            ebpf::LD_DW_IMM => {
                if insn_ptr + 1 >= num_insns {
                    return Err(EbpfError::IncompleteLddw(insn_ptr));
                }
                check_registers(&insn, false, insn_ptr)?;
                lddw_data_slot[insn_ptr + 1] = true;
                insn_ptr += 2;
                continue;
            }

            // BPF_LDX class
            ebpf::LD_B_REG => {}
            ebpf::LD_H_REG => {}
            ebpf::LD_W_REG => {}
            ebpf::LD_DW_REG => {}

            // BPF_ST class
            ebpf::ST_B_IMM => store = true,
            ebpf::ST_H_IMM => store = true,
            ebpf::ST_W_IMM => store = true,
            ebpf::ST_DW_IMM => store = true,

            // BPF_STX class
            ebpf::ST_B_REG => store = true,
            ebpf::ST_H_REG => store = true,
            ebpf::ST_W_REG => store = true,
            ebpf::ST_DW_REG => store = true,

            // BPF_ALU class
            ebpf::ADD32_IMM => {}
            ebpf::ADD32_REG => {}
            ebpf::SUB32_IMM => {}
            ebpf::SUB32_REG => {}
            ebpf::MUL32_IMM => {}
            ebpf::MUL32_REG => {}
            ebpf::DIV32_IMM => {
                if insn.imm == 0 {
                    return Err(EbpfError::DivisionByZero(insn_ptr));
                }
            }
            ebpf::DIV32_REG => {}
            ebpf::OR32_IMM => {}
            ebpf::OR32_REG => {}
            ebpf::AND32_IMM => {}
            ebpf::AND32_REG => {}
            ebpf::LSH32_IMM => check_shift_imm(&insn, insn_ptr, 32)?,
            ebpf::LSH32_REG => {}
            ebpf::RSH32_IMM => check_shift_imm(&insn, insn_ptr, 32)?,
            ebpf::RSH32_REG => {}
            ebpf::NEG32 => {}
            ebpf::MOD32_IMM => {
                if insn.imm == 0 {
                    return Err(EbpfError::DivisionByZero(insn_ptr));
                }
            }
            ebpf::MOD32_REG => {}
            ebpf::XOR32_IMM => {}
            ebpf::XOR32_REG => {}
            ebpf::MOV32_IMM => {}
            ebpf::MOV32_REG => {}
            ebpf::ARSH32_IMM => check_shift_imm(&insn, insn_ptr, 32)?,
            ebpf::ARSH32_REG => {}
            ebpf::LE => check_imm_endian(&insn, insn_ptr)?,
            ebpf::BE => check_imm_endian(&insn, insn_ptr)?,

            // BPF_ALU64 class
            ebpf::ADD64_IMM => {}
            ebpf::ADD64_REG => {}
            ebpf::SUB64_IMM => {}
            ebpf::SUB64_REG => {}
            ebpf::MUL64_IMM => {}
            ebpf::MUL64_REG => {}
            ebpf::DIV64_IMM => {
                if insn.imm == 0 {
                    return Err(EbpfError::DivisionByZero(insn_ptr));
                }
            }
            ebpf::DIV64_REG => {}
            ebpf::OR64_IMM => {}
            ebpf::OR64_REG => {}
            ebpf::AND64_IMM => {}
            ebpf::AND64_REG => {}
            ebpf::LSH64_IMM => check_shift_imm(&insn, insn_ptr, 64)?,
            ebpf::LSH64_REG => {}
            ebpf::RSH64_IMM => check_shift_imm(&insn, insn_ptr, 64)?,
            ebpf::RSH64_REG => {}
            ebpf::NEG64 => {}
            ebpf::MOD64_IMM => {
                if insn.imm == 0 {
                    return Err(EbpfError::DivisionByZero(insn_ptr));
                }
            }
            ebpf::MOD64_REG => {}
            ebpf::XOR64_IMM => {}
            ebpf::XOR64_REG => {}
            ebpf::MOV64_IMM => {}
            ebpf::MOV64_REG => {}
            ebpf::ARSH64_IMM => check_shift_imm(&insn, insn_ptr, 64)?,
            ebpf::ARSH64_REG => {}

            // BPF_JMP class
            ebpf::JA => jumps.push((insn_ptr, insn.off)),
            ebpf::JEQ_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JEQ_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::JGT_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JGT_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::JGE_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JGE_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::JSET_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JSET_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::JNE_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JNE_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::JSGT_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JSGT_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::JSGE_IMM => jumps.push((insn_ptr, insn.off)),
            ebpf::JSGE_REG => jumps.push((insn_ptr, insn.off)),
            ebpf::CALL => {
                if insn.imm < 0 || insn.imm as usize >= ebpf::MAX_HELPERS {
                    return Err(EbpfError::HelperOutOfBounds(
                        insn.imm as usize,
                        ebpf::MAX_HELPERS,
                    ));
                }
            }
            ebpf::EXIT => {}

            _ => {
                return Err(EbpfError::VerifierUnknownOpCode(insn.opc, insn_ptr));
            }
        }

        check_registers(&insn, store, insn_ptr)?;
        insn_ptr += 1;
    }

    for (insn_ptr, off) in jumps {
        let dst_insn_ptr = insn_ptr as isize + off as isize + 1;
        if dst_insn_ptr < 0 || dst_insn_ptr as usize >= num_insns {
            return Err(EbpfError::JumpOutOfCode(dst_insn_ptr, insn_ptr));
        }
        if lddw_data_slot[dst_insn_ptr as usize] {
            return Err(EbpfError::JumpToMiddleOfLddw(insn_ptr));
        }
    }

    Ok(())
}
