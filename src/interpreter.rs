// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: VM architecture, parts of the interpreter, originally in C)
// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//      (Translation to Rust)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interpreter for eBPF programs.
//!
//! The interpreter is the reference for the JIT compiler: for any verified program and any
//! input, both must produce the same result. The observable corner cases are aligned with the
//! generated x86-64 code: 32-bit operations zero-extend into the full destination register,
//! shift counts are masked to the operand width, division and modulo are unsigned, and a
//! division by zero prints a diagnostic to stderr and makes the program return `u64::MAX`.
//!
//! Memory accesses are performed directly on host addresses. Programs are expected to have been
//! checked by the verifier; memory safety within the program is the caller's contract.

use crate::{ebpf, error::EbpfError};
use log::{log_enabled, trace};
use std::ptr;

/// Reports a division by zero, from the interpreter or from JIT-compiled code. The diagnostic
/// format is stable; the PC names the offending division instruction.
pub(crate) extern "C" fn report_div_by_zero(pc: u64) {
    eprintln!("uBPF error: division by zero at PC {}", pc);
}

pub(crate) fn execute_program(
    prog: &[u8],
    mem: &mut [u8],
    helpers: &[Option<ebpf::Helper>; ebpf::MAX_HELPERS],
) -> Result<u64, EbpfError> {
    let stack = vec![0u8; ebpf::STACK_SIZE];

    // R1 points to the beginning of the input memory, R10 to the top of the stack frame.
    let mut reg: [u64; 11] = [0; 11];
    reg[10] = stack.as_ptr() as u64 + ebpf::STACK_SIZE as u64;
    if !mem.is_empty() {
        reg[1] = mem.as_mut_ptr() as u64;
    }

    // Check trace logging outside the instruction loop, saves ~30%
    let insn_trace = log_enabled!(log::Level::Trace);

    let num_insns = prog.len() / ebpf::INSN_SIZE;
    let mut pc: usize = 0;
    while pc < num_insns {
        if insn_trace {
            trace!("    BPF: pc {:4?} {:016x?}", pc, reg);
        }
        let insn = ebpf::get_insn(prog, pc);
        let this_pc = pc;
        let dst = insn.dst as usize;
        let src = insn.src as usize;
        pc += 1;

        match insn.opc {
            // BPF_LD class
            ebpf::LD_DW_IMM => {
                let next_insn = ebpf::get_insn(prog, pc);
                pc += 1;
                reg[dst] = (insn.imm as u32) as u64 | (next_insn.imm as u64).wrapping_shl(32);
            }

            // BPF_LDX class
            ebpf::LD_B_REG => {
                reg[dst] = unsafe {
                    let addr = reg[src].wrapping_add(insn.off as u64) as *const u8;
                    ptr::read_unaligned(addr) as u64
                }
            }
            ebpf::LD_H_REG => {
                reg[dst] = unsafe {
                    let addr = reg[src].wrapping_add(insn.off as u64) as *const u16;
                    ptr::read_unaligned(addr) as u64
                }
            }
            ebpf::LD_W_REG => {
                reg[dst] = unsafe {
                    let addr = reg[src].wrapping_add(insn.off as u64) as *const u32;
                    ptr::read_unaligned(addr) as u64
                }
            }
            ebpf::LD_DW_REG => {
                reg[dst] = unsafe {
                    let addr = reg[src].wrapping_add(insn.off as u64) as *const u64;
                    ptr::read_unaligned(addr)
                }
            }

            // BPF_ST class
            ebpf::ST_B_IMM => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u8;
                ptr::write_unaligned(addr, insn.imm as u8);
            },
            ebpf::ST_H_IMM => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u16;
                ptr::write_unaligned(addr, insn.imm as u16);
            },
            ebpf::ST_W_IMM => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u32;
                ptr::write_unaligned(addr, insn.imm as u32);
            },
            ebpf::ST_DW_IMM => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u64;
                // The 64-bit store takes a sign-extended 32-bit immediate.
                ptr::write_unaligned(addr, insn.imm as i64 as u64);
            },

            // BPF_STX class
            ebpf::ST_B_REG => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u8;
                ptr::write_unaligned(addr, reg[src] as u8);
            },
            ebpf::ST_H_REG => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u16;
                ptr::write_unaligned(addr, reg[src] as u16);
            },
            ebpf::ST_W_REG => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u32;
                ptr::write_unaligned(addr, reg[src] as u32);
            },
            ebpf::ST_DW_REG => unsafe {
                let addr = reg[dst].wrapping_add(insn.off as u64) as *mut u64;
                ptr::write_unaligned(addr, reg[src]);
            },

            // BPF_ALU class
            ebpf::ADD32_IMM => reg[dst] = (reg[dst] as u32).wrapping_add(insn.imm as u32) as u64,
            ebpf::ADD32_REG => reg[dst] = (reg[dst] as u32).wrapping_add(reg[src] as u32) as u64,
            ebpf::SUB32_IMM => reg[dst] = (reg[dst] as u32).wrapping_sub(insn.imm as u32) as u64,
            ebpf::SUB32_REG => reg[dst] = (reg[dst] as u32).wrapping_sub(reg[src] as u32) as u64,
            ebpf::MUL32_IMM => reg[dst] = (reg[dst] as u32).wrapping_mul(insn.imm as u32) as u64,
            ebpf::MUL32_REG => reg[dst] = (reg[dst] as u32).wrapping_mul(reg[src] as u32) as u64,
            ebpf::DIV32_IMM => {
                if insn.imm as u32 == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] = ((reg[dst] as u32) / (insn.imm as u32)) as u64;
            }
            ebpf::DIV32_REG => {
                if reg[src] as u32 == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] = ((reg[dst] as u32) / (reg[src] as u32)) as u64;
            }
            ebpf::OR32_IMM => reg[dst] = (reg[dst] as u32 | insn.imm as u32) as u64,
            ebpf::OR32_REG => reg[dst] = (reg[dst] as u32 | reg[src] as u32) as u64,
            ebpf::AND32_IMM => reg[dst] = (reg[dst] as u32 & insn.imm as u32) as u64,
            ebpf::AND32_REG => reg[dst] = (reg[dst] as u32 & reg[src] as u32) as u64,
            // Shift counts are masked to the operand width, as the hardware masks them.
            ebpf::LSH32_IMM => reg[dst] = (reg[dst] as u32).wrapping_shl(insn.imm as u32) as u64,
            ebpf::LSH32_REG => reg[dst] = (reg[dst] as u32).wrapping_shl(reg[src] as u32) as u64,
            ebpf::RSH32_IMM => reg[dst] = (reg[dst] as u32).wrapping_shr(insn.imm as u32) as u64,
            ebpf::RSH32_REG => reg[dst] = (reg[dst] as u32).wrapping_shr(reg[src] as u32) as u64,
            ebpf::NEG32 => reg[dst] = (reg[dst] as i32).wrapping_neg() as u32 as u64,
            ebpf::MOD32_IMM => {
                if insn.imm as u32 == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] = ((reg[dst] as u32) % (insn.imm as u32)) as u64;
            }
            ebpf::MOD32_REG => {
                if reg[src] as u32 == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] = ((reg[dst] as u32) % (reg[src] as u32)) as u64;
            }
            ebpf::XOR32_IMM => reg[dst] = (reg[dst] as u32 ^ insn.imm as u32) as u64,
            ebpf::XOR32_REG => reg[dst] = (reg[dst] as u32 ^ reg[src] as u32) as u64,
            ebpf::MOV32_IMM => reg[dst] = insn.imm as u32 as u64,
            ebpf::MOV32_REG => reg[dst] = reg[src] as u32 as u64,
            ebpf::ARSH32_IMM => {
                reg[dst] = (reg[dst] as i32).wrapping_shr(insn.imm as u32) as u32 as u64
            }
            ebpf::ARSH32_REG => {
                reg[dst] = (reg[dst] as i32).wrapping_shr(reg[src] as u32) as u32 as u64
            }
            // The host is little-endian, so LE conversions keep the register as it is. This
            // mirrors the compiled code, which does not emit anything for them.
            ebpf::LE => {}
            ebpf::BE => {
                reg[dst] = match insn.imm {
                    16 => (reg[dst] as u16).swap_bytes() as u64,
                    32 => (reg[dst] as u32).swap_bytes() as u64,
                    64 => reg[dst].swap_bytes(),
                    _ => unreachable!(), // Rejected by the verifier
                };
            }

            // BPF_ALU64 class
            ebpf::ADD64_IMM => reg[dst] = reg[dst].wrapping_add(insn.imm as u64),
            ebpf::ADD64_REG => reg[dst] = reg[dst].wrapping_add(reg[src]),
            ebpf::SUB64_IMM => reg[dst] = reg[dst].wrapping_sub(insn.imm as u64),
            ebpf::SUB64_REG => reg[dst] = reg[dst].wrapping_sub(reg[src]),
            ebpf::MUL64_IMM => reg[dst] = reg[dst].wrapping_mul(insn.imm as u64),
            ebpf::MUL64_REG => reg[dst] = reg[dst].wrapping_mul(reg[src]),
            ebpf::DIV64_IMM => {
                if insn.imm == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] /= insn.imm as u64;
            }
            ebpf::DIV64_REG => {
                if reg[src] == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] /= reg[src];
            }
            ebpf::OR64_IMM => reg[dst] |= insn.imm as u64,
            ebpf::OR64_REG => reg[dst] |= reg[src],
            ebpf::AND64_IMM => reg[dst] &= insn.imm as u64,
            ebpf::AND64_REG => reg[dst] &= reg[src],
            ebpf::LSH64_IMM => reg[dst] = reg[dst].wrapping_shl(insn.imm as u32),
            ebpf::LSH64_REG => reg[dst] = reg[dst].wrapping_shl(reg[src] as u32),
            ebpf::RSH64_IMM => reg[dst] = reg[dst].wrapping_shr(insn.imm as u32),
            ebpf::RSH64_REG => reg[dst] = reg[dst].wrapping_shr(reg[src] as u32),
            ebpf::NEG64 => reg[dst] = (reg[dst] as i64).wrapping_neg() as u64,
            ebpf::MOD64_IMM => {
                if insn.imm == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] %= insn.imm as u64;
            }
            ebpf::MOD64_REG => {
                if reg[src] == 0 {
                    report_div_by_zero(this_pc as u64);
                    return Ok(u64::MAX);
                }
                reg[dst] %= reg[src];
            }
            ebpf::XOR64_IMM => reg[dst] ^= insn.imm as u64,
            ebpf::XOR64_REG => reg[dst] ^= reg[src],
            ebpf::MOV64_IMM => reg[dst] = insn.imm as u64,
            ebpf::MOV64_REG => reg[dst] = reg[src],
            ebpf::ARSH64_IMM => {
                reg[dst] = (reg[dst] as i64).wrapping_shr(insn.imm as u32) as u64
            }
            ebpf::ARSH64_REG => {
                reg[dst] = (reg[dst] as i64).wrapping_shr(reg[src] as u32) as u64
            }

            // BPF_JMP class
            // Immediate operands are sign-extended to 64 bits before the comparison, exactly
            // as `cmp r/m64, imm32` sign-extends on x86-64.
            ebpf::JA => {
                pc = (pc as isize + insn.off as isize) as usize;
            }
            ebpf::JEQ_IMM => {
                if reg[dst] == insn.imm as u64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JEQ_REG => {
                if reg[dst] == reg[src] {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JGT_IMM => {
                if reg[dst] > insn.imm as u64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JGT_REG => {
                if reg[dst] > reg[src] {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JGE_IMM => {
                if reg[dst] >= insn.imm as u64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JGE_REG => {
                if reg[dst] >= reg[src] {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JSET_IMM => {
                if reg[dst] & insn.imm as u64 != 0 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JSET_REG => {
                if reg[dst] & reg[src] != 0 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JNE_IMM => {
                if reg[dst] != insn.imm as u64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JNE_REG => {
                if reg[dst] != reg[src] {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JSGT_IMM => {
                if reg[dst] as i64 > insn.imm as i64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JSGT_REG => {
                if reg[dst] as i64 > reg[src] as i64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JSGE_IMM => {
                if reg[dst] as i64 >= insn.imm as i64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }
            ebpf::JSGE_REG => {
                if reg[dst] as i64 >= reg[src] as i64 {
                    pc = (pc as isize + insn.off as isize) as usize;
                }
            }

            ebpf::CALL => match helpers.get(insn.imm as usize).copied().flatten() {
                Some(function) => reg[0] = function(reg[1], reg[2], reg[3], reg[4], reg[5]),
                None => return Err(EbpfError::UnknownHelper(insn.imm as u32, this_pc)),
            },
            ebpf::EXIT => return Ok(reg[0]),

            opc => return Err(EbpfError::UnknownOpCode(opc, this_pc)),
        }
    }

    Err(EbpfError::ExecutionOverrun(pc))
}
