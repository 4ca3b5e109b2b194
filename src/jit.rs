// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: JIT algorithm, originally in C)
// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//      (Translation to Rust)
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! JIT compiler translating eBPF programs to x86-64 machine code.
//!
//! The translation is a single pass over the instructions, emitting into a byte buffer and
//! recording a relocation for every branch whose target is not yet known. Once the whole
//! program has been emitted the relocations are resolved against the per-PC label table, the
//! buffer is copied into an anonymous mapping and the mapping is switched to read-execute.
//! The mapping is never writable and executable at the same time.
//!
//! Compiled programs follow the System V calling convention: the context pointer arrives in
//! RDI (eBPF r1), the result is returned in RAX (eBPF r0), and the callee-saved registers
//! used by the register assignment are saved in the prologue and restored in the epilogue.

use crate::{ebpf, error::EbpfError, interpreter::report_div_by_zero};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{collections::HashMap, fmt, mem, ptr};

/// A JIT-compiled program, called with the input memory pointer in the register mapped to r1.
pub type MachineCode = unsafe fn(*mut u8) -> u64;

// Registers
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

const REGISTER_MAP_SIZE: usize = 11;
const REGISTER_MAP: [u8; REGISTER_MAP_SIZE] = [
    RAX, // 0  return value
    RDI, // 1  arg 1
    RSI, // 2  arg 2
    RDX, // 3  arg 3
    R9,  // 4  arg 4
    R8,  // 5  arg 5
    RBX, // 6  callee-saved
    R13, // 7  callee-saved
    R14, // 8  callee-saved
    R15, // 9  callee-saved
    RBP, // 10 stack pointer
         // RCX is the reserved scratch register: shift counts, the staged PC on the
         // division-by-zero path, and call argument shuffling all go through it. RSP is
         // reserved by the ABI, R12 is not part of the assignment either.
];

/// The assignment of the eBPF registers r0..r10 onto x86-64 registers, fixed for the duration
/// of one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    regs: [u8; REGISTER_MAP_SIZE],
}

impl Default for RegisterMap {
    fn default() -> Self {
        RegisterMap { regs: REGISTER_MAP }
    }
}

impl RegisterMap {
    /// Derive a permuted register assignment, for testing. An `offset` below 11 rotates the
    /// default table by that many positions; any other value seeds a Fisher–Yates shuffle of
    /// it. A program compiled with any permutation behaves identically to one compiled with
    /// the default table; the hook exists to prove the translator never hardcodes a register
    /// identity.
    pub fn with_offset(offset: u32) -> Self {
        let mut regs = REGISTER_MAP;
        if (offset as usize) < REGISTER_MAP_SIZE {
            regs.rotate_left(offset as usize);
        } else {
            let mut rng = SmallRng::seed_from_u64(offset as u64);
            for i in (1..REGISTER_MAP_SIZE).rev() {
                regs.swap(i, rng.gen_range(0..=i));
            }
        }
        RegisterMap { regs }
    }

    // Return the x86 register for the given eBPF register.
    fn map(&self, r: u8) -> u8 {
        debug_assert!(
            (r as usize) < REGISTER_MAP_SIZE,
            "eBPF register r{} out of range",
            r
        );
        self.regs[r as usize % REGISTER_MAP_SIZE]
    }

    fn is_default(&self) -> bool {
        self.regs == REGISTER_MAP
    }
}

// Special values for target_pc in struct Jump
const TARGET_OFFSET: isize = ebpf::PROG_MAX_INSNS as isize;
const TARGET_PC_EXIT: isize = TARGET_OFFSET + 1;
const TARGET_PC_EPILOGUE: isize = TARGET_OFFSET + 2;
const TARGET_PC_DIV_BY_ZERO: isize = TARGET_OFFSET + 3;

#[derive(Copy, Clone)]
enum OperandSize {
    S8 = 8,
    S16 = 16,
    S32 = 32,
    S64 = 64,
}

#[derive(Debug)]
struct Jump {
    offset_loc: usize,
    target_pc: isize,
}

struct JitCompiler {
    contents: Vec<u8>,
    pc_locs: Vec<usize>,
    special_targets: HashMap<isize, usize>,
    jumps: Vec<Jump>,
    register_map: RegisterMap,
}

impl JitCompiler {
    fn new(num_insns: usize, register_map: RegisterMap) -> JitCompiler {
        JitCompiler {
            contents: Vec::with_capacity(num_insns * 32 + 256),
            pc_locs: vec![0; num_insns],
            special_targets: HashMap::new(),
            jumps: vec![],
            register_map,
        }
    }

    fn offset(&self) -> usize {
        self.contents.len()
    }

    fn emit1(&mut self, data: u8) {
        self.contents.push(data);
    }

    fn emit2(&mut self, data: u16) {
        self.contents.extend_from_slice(&data.to_le_bytes());
    }

    fn emit4(&mut self, data: u32) {
        self.contents.extend_from_slice(&data.to_le_bytes());
    }

    fn emit8(&mut self, data: u64) {
        self.contents.extend_from_slice(&data.to_le_bytes());
    }

    fn emit_modrm(&mut self, modrm: u8, r: u8, m: u8) {
        assert_eq!(modrm | 0xc0, 0xc0);
        self.emit1((modrm & 0xc0) | ((r & 0b111) << 3) | (m & 0b111));
    }

    fn emit_modrm_reg2reg(&mut self, r: u8, m: u8) {
        self.emit_modrm(0xc0, r, m);
    }

    fn emit_modrm_and_displacement(&mut self, r: u8, m: u8, d: i32) {
        // A base of RSP or R12 needs SIB addressing, which nothing here ever emits.
        debug_assert_ne!(m & 0b111, RSP);
        if d == 0 && (m & 0b111) != RBP {
            self.emit_modrm(0x00, r, m);
        } else if (-128..=127).contains(&d) {
            self.emit_modrm(0x40, r, m);
            self.emit1(d as u8);
        } else {
            self.emit_modrm(0x80, r, m);
            self.emit4(d as u32);
        }
    }

    fn emit_rex(&mut self, w: u8, r: u8, x: u8, b: u8) {
        assert_eq!(w | 1, 1);
        assert_eq!(r | 1, 1);
        assert_eq!(x | 1, 1);
        assert_eq!(b | 1, 1);
        self.emit1(0x40 | (w << 3) | (r << 2) | (x << 1) | b);
    }

    // Emits a REX prefix with the top bit of src and dst.
    // Skipped if no bits would be set.
    fn emit_basic_rex(&mut self, w: u8, src: u8, dst: u8) {
        let is_masked = |val, mask| match val & mask {
            0 => 0,
            _ => 1,
        };
        let src_masked = is_masked(src, 0b1000);
        let dst_masked = is_masked(dst, 0b1000);
        if w != 0 || src_masked != 0 || dst_masked != 0 {
            self.emit_rex(w, src_masked, 0, dst_masked);
        }
    }

    fn emit_push(&mut self, r: u8) {
        self.emit_basic_rex(0, 0, r);
        self.emit1(0x50 | (r & 0b111));
    }

    fn emit_pop(&mut self, r: u8) {
        self.emit_basic_rex(0, 0, r);
        self.emit1(0x58 | (r & 0b111));
    }

    // REX prefix and ModRM byte
    // We use the MR encoding when there is a choice
    // 'src' is often used as an opcode extension
    fn emit_alu32(&mut self, op: u8, src: u8, dst: u8) {
        self.emit_basic_rex(0, src, dst);
        self.emit1(op);
        self.emit_modrm_reg2reg(src, dst);
    }

    // REX prefix, ModRM byte, and 32-bit immediate
    fn emit_alu32_imm32(&mut self, op: u8, src: u8, dst: u8, imm: i32) {
        self.emit_alu32(op, src, dst);
        self.emit4(imm as u32);
    }

    // REX prefix, ModRM byte, and 8-bit immediate
    fn emit_alu32_imm8(&mut self, op: u8, src: u8, dst: u8, imm: i8) {
        self.emit_alu32(op, src, dst);
        self.emit1(imm as u8);
    }

    // REX.W prefix and ModRM byte
    // We use the MR encoding when there is a choice
    // 'src' is often used as an opcode extension
    fn emit_alu64(&mut self, op: u8, src: u8, dst: u8) {
        self.emit_basic_rex(1, src, dst);
        self.emit1(op);
        self.emit_modrm_reg2reg(src, dst);
    }

    // REX.W prefix, ModRM byte, and 32-bit immediate
    fn emit_alu64_imm32(&mut self, op: u8, src: u8, dst: u8, imm: i32) {
        self.emit_alu64(op, src, dst);
        self.emit4(imm as u32);
    }

    // REX.W prefix, ModRM byte, and 8-bit immediate
    fn emit_alu64_imm8(&mut self, op: u8, src: u8, dst: u8, imm: i8) {
        self.emit_alu64(op, src, dst);
        self.emit1(imm as u8);
    }

    // Register to register mov
    fn emit_mov(&mut self, src: u8, dst: u8) {
        self.emit_alu64(0x89, src, dst);
    }

    // Register to register mov on the lower 32 bits, zeroing the upper half
    fn emit_mov32(&mut self, src: u8, dst: u8) {
        self.emit_alu32(0x89, src, dst);
    }

    fn emit_cmp_imm32(&mut self, dst: u8, imm: i32) {
        self.emit_alu64_imm32(0x81, 7, dst, imm);
    }

    fn emit_cmp(&mut self, src: u8, dst: u8) {
        self.emit_alu64(0x39, src, dst);
    }

    // Load [src + offset] into dst, zero-extending bytes and half-words
    fn emit_load(&mut self, size: OperandSize, src: u8, dst: u8, offset: i32) {
        let data = match size {
            OperandSize::S64 => 1,
            _ => 0,
        };
        self.emit_basic_rex(data, dst, src);

        match size {
            OperandSize::S8 => {
                // movzx
                self.emit1(0x0f);
                self.emit1(0xb6);
            }
            OperandSize::S16 => {
                // movzx
                self.emit1(0x0f);
                self.emit1(0xb7);
            }
            OperandSize::S32 | OperandSize::S64 => {
                // mov
                self.emit1(0x8b);
            }
        }

        self.emit_modrm_and_displacement(dst, src, offset);
    }

    // Load sign-extended immediate into register
    fn emit_load_imm(&mut self, dst: u8, imm: i64) {
        if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
            self.emit_alu64_imm32(0xc7, 0, dst, imm as i32);
        } else {
            // movabs $imm,dst
            self.emit_basic_rex(1, 0, dst);
            self.emit1(0xb8 | (dst & 0b111));
            self.emit8(imm as u64);
        }
    }

    // Store register src to [dst + offset]
    #[rustfmt::skip]
    fn emit_store(&mut self, size: OperandSize, src: u8, dst: u8, offset: i32) {
        if let OperandSize::S16 = size {
            self.emit1(0x66); // 16-bit override
        }
        let (is_s8, is_u64, rexw) = match size {
            OperandSize::S8  => (true, false, 0),
            OperandSize::S64 => (false, true, 1),
            _                => (false, false, 0),
        };
        // Byte stores always carry a REX prefix so that SIL/DIL and the R8B..R15B forms are
        // encoded instead of the legacy AH..BH registers.
        if is_u64 || (src & 0b1000) != 0 || (dst & 0b1000) != 0 || is_s8 {
            let is_masked = |val, mask| match val & mask {
                0 => 0,
                _ => 1,
            };
            self.emit_rex(rexw, is_masked(src, 8), 0, is_masked(dst, 8));
        }
        match size {
            OperandSize::S8 => self.emit1(0x88),
            _               => self.emit1(0x89),
        };
        self.emit_modrm_and_displacement(src, dst, offset);
    }

    // Store immediate to [dst + offset]
    #[rustfmt::skip]
    fn emit_store_imm32(&mut self, size: OperandSize, dst: u8, offset: i32, imm: i32) {
        if let OperandSize::S16 = size {
            self.emit1(0x66); // 16-bit override
        }
        match size {
            OperandSize::S64 => self.emit_basic_rex(1, 0, dst),
            _                => self.emit_basic_rex(0, 0, dst),
        };
        match size {
            OperandSize::S8 => self.emit1(0xc6),
            _               => self.emit1(0xc7),
        };
        self.emit_modrm_and_displacement(0, dst, offset);
        match size {
            OperandSize::S8  => self.emit1(imm as u8),
            OperandSize::S16 => self.emit2(imm as u16),
            _                => self.emit4(imm as u32),
        };
    }

    // Call the function at the given host address through RAX
    fn emit_call(&mut self, target: usize) {
        self.emit_load_imm(RAX, target as i64);
        // callq *%rax
        self.emit1(0xff);
        self.emit1(0xd0);
    }

    fn emit_jump_offset(&mut self, target_pc: isize) {
        self.jumps.push(Jump {
            offset_loc: self.offset(),
            target_pc,
        });
        self.emit4(0);
    }

    fn emit_jcc(&mut self, code: u8, target_pc: isize) {
        self.emit1(0x0f);
        self.emit1(code);
        self.emit_jump_offset(target_pc);
    }

    fn emit_jmp(&mut self, target_pc: isize) {
        self.emit1(0xe9);
        self.emit_jump_offset(target_pc);
    }

    fn set_anchor(&mut self, target: isize) {
        self.special_targets.insert(target, self.offset());
    }

    // mul/div/mod have implicit operands in RAX and RDX, so both are saved around the
    // operation unless one of them is the destination. eBPF divisions are unsigned.
    fn emit_muldivmod(&mut self, pc: usize, opc: u8, src: u8, dst: u8, imm: i32) {
        let mul = (opc & ebpf::BPF_ALU_OP_MASK) == ebpf::BPF_MUL;
        let div = (opc & ebpf::BPF_ALU_OP_MASK) == ebpf::BPF_DIV;
        let modrm = (opc & ebpf::BPF_ALU_OP_MASK) == ebpf::BPF_MOD;
        let is64 = (opc & ebpf::BPF_CLS_MASK) == ebpf::BPF_ALU64;
        let is_reg = (opc & ebpf::BPF_X) == ebpf::BPF_X;

        if (div || modrm) && is_reg {
            // Stage the PC for the trampoline, which reports it on the failure path.
            self.emit_load_imm(RCX, pc as i64);

            // test src,src
            if is64 {
                self.emit_alu64(0x85, src, src);
            } else {
                self.emit_alu32(0x85, src, src);
            }

            // Jump if src is zero
            self.emit_jcc(0x84, TARGET_PC_DIV_BY_ZERO);
        }
        if (div || modrm) && !is_reg && imm == 0 {
            // A zero divisor immediate is rejected at load time; keep the runtime honest in
            // case an unverified program reaches the compiler anyway.
            self.emit_load_imm(RCX, pc as i64);
            self.emit_jmp(TARGET_PC_DIV_BY_ZERO);
            return;
        }

        if dst != RAX {
            self.emit_push(RAX);
        }
        if dst != RDX {
            self.emit_push(RDX);
        }
        if is_reg {
            self.emit_mov(src, RCX);
        } else {
            self.emit_load_imm(RCX, imm as i64);
        }

        self.emit_mov(dst, RAX);

        if div || modrm {
            // xor %edx,%edx
            self.emit_alu32(0x31, RDX, RDX);
        }

        if is64 {
            self.emit_rex(1, 0, 0, 0);
        }

        // mul %ecx or div %ecx
        self.emit_alu32(0xf7, if mul { 4 } else { 6 }, RCX);

        if dst != RDX {
            if modrm {
                self.emit_mov(RDX, dst);
            }
            self.emit_pop(RDX);
        }
        if dst != RAX {
            if div || mul {
                self.emit_mov(RAX, dst);
            }
            self.emit_pop(RAX);
        }
    }

    // Move the values of eBPF r1..r5 into the System V argument registers, call the helper,
    // and land its return value in r0's assignment.
    fn emit_helper_call(&mut self, function: usize) {
        if self.register_map.is_default() {
            // With the default assignment the argument registers already hold r1, r2, r3 and
            // r5; only r4 has to move from R9 into the reserved RCX.
            self.emit_mov(R9, RCX);
        } else {
            // Arbitrary assignments are staged through the stack so that overlapping moves
            // cannot clobber one another.
            for r in 1..=5 {
                self.emit_push(self.register_map.map(r));
            }
            for &arg_reg in &[R8, RCX, RDX, RSI, RDI] {
                self.emit_pop(arg_reg);
            }
        }
        self.emit_call(function);
        if self.register_map.map(0) != RAX {
            self.emit_mov(RAX, self.register_map.map(0));
        }
    }

    #[rustfmt::skip]
    fn jit_compile(
        &mut self,
        prog: &[u8],
        helpers: &[Option<ebpf::Helper>; ebpf::MAX_HELPERS],
    ) -> Result<(), EbpfError> {
        self.emit_push(RBP);
        self.emit_push(RBX);
        self.emit_push(R13);
        self.emit_push(R14);
        self.emit_push(R15);

        // The context pointer arrives in RDI, the first System V argument register.
        if self.register_map.map(1) != RDI {
            self.emit_mov(RDI, self.register_map.map(1));
        }

        // R10 points at the top of the eBPF stack frame; the frame itself lies between the
        // adjusted RSP and R10, so that negative offsets from r10 stay inside it.
        self.emit_mov(RSP, self.register_map.map(10));

        // Allocate stack space
        self.emit_alu64_imm32(0x81, 5, RSP, ebpf::STACK_SIZE as i32);

        let num_insns = prog.len() / ebpf::INSN_SIZE;
        let mut insn_ptr: usize = 0;
        while insn_ptr < num_insns {
            let insn = ebpf::get_insn(prog, insn_ptr);

            self.pc_locs[insn_ptr] = self.offset();

            let dst = self.register_map.map(insn.dst);
            let src = self.register_map.map(insn.src);
            let target_pc = insn_ptr as isize + insn.off as isize + 1;

            match insn.opc {

                // BPF_LD class
                ebpf::LD_DW_IMM  => {
                    insn_ptr += 1;
                    if insn_ptr >= num_insns {
                        return Err(EbpfError::IncompleteLddw(insn_ptr - 1));
                    }
                    let second_part = ebpf::get_insn(prog, insn_ptr).imm as u64;
                    // The lower half is zero-extended before the OR, not sign-extended.
                    let imm = (insn.imm as u32) as u64 | second_part.wrapping_shl(32);
                    self.emit_load_imm(dst, imm as i64);
                }

                // BPF_LDX class
                ebpf::LD_B_REG   => self.emit_load(OperandSize::S8,  src, dst, insn.off as i32),
                ebpf::LD_H_REG   => self.emit_load(OperandSize::S16, src, dst, insn.off as i32),
                ebpf::LD_W_REG   => self.emit_load(OperandSize::S32, src, dst, insn.off as i32),
                ebpf::LD_DW_REG  => self.emit_load(OperandSize::S64, src, dst, insn.off as i32),

                // BPF_ST class
                ebpf::ST_B_IMM   => self.emit_store_imm32(OperandSize::S8,  dst, insn.off as i32, insn.imm),
                ebpf::ST_H_IMM   => self.emit_store_imm32(OperandSize::S16, dst, insn.off as i32, insn.imm),
                ebpf::ST_W_IMM   => self.emit_store_imm32(OperandSize::S32, dst, insn.off as i32, insn.imm),
                ebpf::ST_DW_IMM  => self.emit_store_imm32(OperandSize::S64, dst, insn.off as i32, insn.imm),

                // BPF_STX class
                ebpf::ST_B_REG   => self.emit_store(OperandSize::S8,  src, dst, insn.off as i32),
                ebpf::ST_H_REG   => self.emit_store(OperandSize::S16, src, dst, insn.off as i32),
                ebpf::ST_W_REG   => self.emit_store(OperandSize::S32, src, dst, insn.off as i32),
                ebpf::ST_DW_REG  => self.emit_store(OperandSize::S64, src, dst, insn.off as i32),

                // BPF_ALU class
                // 32-bit instructions write 32-bit destinations; the implicit zero-extension
                // into the upper half is part of the required semantics.
                ebpf::ADD32_IMM  => self.emit_alu32_imm32(0x81, 0, dst, insn.imm),
                ebpf::ADD32_REG  => self.emit_alu32(0x01, src, dst),
                ebpf::SUB32_IMM  => self.emit_alu32_imm32(0x81, 5, dst, insn.imm),
                ebpf::SUB32_REG  => self.emit_alu32(0x29, src, dst),
                ebpf::MUL32_IMM | ebpf::MUL32_REG
                | ebpf::DIV32_IMM | ebpf::DIV32_REG
                | ebpf::MOD32_IMM | ebpf::MOD32_REG
                    => self.emit_muldivmod(insn_ptr, insn.opc, src, dst, insn.imm),
                ebpf::OR32_IMM   => self.emit_alu32_imm32(0x81, 1, dst, insn.imm),
                ebpf::OR32_REG   => self.emit_alu32(0x09, src, dst),
                ebpf::AND32_IMM  => self.emit_alu32_imm32(0x81, 4, dst, insn.imm),
                ebpf::AND32_REG  => self.emit_alu32(0x21, src, dst),
                ebpf::LSH32_IMM  => self.emit_alu32_imm8(0xc1, 4, dst, insn.imm as i8),
                ebpf::LSH32_REG  => {
                    // The x86 ISA wants variable shift counts in CL.
                    self.emit_mov(src, RCX);
                    self.emit_alu32(0xd3, 4, dst);
                }
                ebpf::RSH32_IMM  => self.emit_alu32_imm8(0xc1, 5, dst, insn.imm as i8),
                ebpf::RSH32_REG  => {
                    self.emit_mov(src, RCX);
                    self.emit_alu32(0xd3, 5, dst);
                }
                ebpf::NEG32      => self.emit_alu32(0xf7, 3, dst),
                ebpf::XOR32_IMM  => self.emit_alu32_imm32(0x81, 6, dst, insn.imm),
                ebpf::XOR32_REG  => self.emit_alu32(0x31, src, dst),
                ebpf::MOV32_IMM  => self.emit_alu32_imm32(0xc7, 0, dst, insn.imm),
                ebpf::MOV32_REG  => self.emit_mov32(src, dst),
                ebpf::ARSH32_IMM => self.emit_alu32_imm8(0xc1, 7, dst, insn.imm as i8),
                ebpf::ARSH32_REG => {
                    self.emit_mov(src, RCX);
                    self.emit_alu32(0xd3, 7, dst);
                }
                ebpf::LE         => {} // No-op, the host is little-endian
                ebpf::BE         => {
                    match insn.imm {
                        16 => {
                            // rol dst, 8
                            self.emit1(0x66); // 16-bit override
                            self.emit_alu32_imm8(0xc1, 0, dst, 8);
                            // and dst, 0xffff; also zeroes the upper 48 bits
                            self.emit_alu32_imm32(0x81, 4, dst, 0xffff);
                        }
                        32 | 64 => {
                            // bswap
                            let bit = match insn.imm { 64 => 1, _ => 0 };
                            self.emit_basic_rex(bit, 0, dst);
                            self.emit1(0x0f);
                            self.emit1(0xc8 | (dst & 0b111));
                        }
                        _ => unreachable!(), // Rejected by the verifier
                    }
                }

                // BPF_ALU64 class
                ebpf::ADD64_IMM  => self.emit_alu64_imm32(0x81, 0, dst, insn.imm),
                ebpf::ADD64_REG  => self.emit_alu64(0x01, src, dst),
                ebpf::SUB64_IMM  => self.emit_alu64_imm32(0x81, 5, dst, insn.imm),
                ebpf::SUB64_REG  => self.emit_alu64(0x29, src, dst),
                ebpf::MUL64_IMM | ebpf::MUL64_REG
                | ebpf::DIV64_IMM | ebpf::DIV64_REG
                | ebpf::MOD64_IMM | ebpf::MOD64_REG
                    => self.emit_muldivmod(insn_ptr, insn.opc, src, dst, insn.imm),
                ebpf::OR64_IMM   => self.emit_alu64_imm32(0x81, 1, dst, insn.imm),
                ebpf::OR64_REG   => self.emit_alu64(0x09, src, dst),
                ebpf::AND64_IMM  => self.emit_alu64_imm32(0x81, 4, dst, insn.imm),
                ebpf::AND64_REG  => self.emit_alu64(0x21, src, dst),
                ebpf::LSH64_IMM  => self.emit_alu64_imm8(0xc1, 4, dst, insn.imm as i8),
                ebpf::LSH64_REG  => {
                    self.emit_mov(src, RCX);
                    self.emit_alu64(0xd3, 4, dst);
                }
                ebpf::RSH64_IMM  => self.emit_alu64_imm8(0xc1, 5, dst, insn.imm as i8),
                ebpf::RSH64_REG  => {
                    self.emit_mov(src, RCX);
                    self.emit_alu64(0xd3, 5, dst);
                }
                ebpf::NEG64      => self.emit_alu64(0xf7, 3, dst),
                ebpf::XOR64_IMM  => self.emit_alu64_imm32(0x81, 6, dst, insn.imm),
                ebpf::XOR64_REG  => self.emit_alu64(0x31, src, dst),
                ebpf::MOV64_IMM  => self.emit_load_imm(dst, insn.imm as i64),
                ebpf::MOV64_REG  => self.emit_mov(src, dst),
                ebpf::ARSH64_IMM => self.emit_alu64_imm8(0xc1, 7, dst, insn.imm as i8),
                ebpf::ARSH64_REG => {
                    self.emit_mov(src, RCX);
                    self.emit_alu64(0xd3, 7, dst);
                }

                // BPF_JMP class
                // Branch offsets are relative to the next instruction, resolved through the
                // per-PC label table once the whole program has been emitted.
                ebpf::JA         => self.emit_jmp(target_pc),
                ebpf::JEQ_IMM    => {
                    self.emit_cmp_imm32(dst, insn.imm);
                    self.emit_jcc(0x84, target_pc);
                }
                ebpf::JEQ_REG    => {
                    self.emit_cmp(src, dst);
                    self.emit_jcc(0x84, target_pc);
                }
                ebpf::JGT_IMM    => {
                    self.emit_cmp_imm32(dst, insn.imm);
                    self.emit_jcc(0x87, target_pc); // ja, unsigned
                }
                ebpf::JGT_REG    => {
                    self.emit_cmp(src, dst);
                    self.emit_jcc(0x87, target_pc);
                }
                ebpf::JGE_IMM    => {
                    self.emit_cmp_imm32(dst, insn.imm);
                    self.emit_jcc(0x83, target_pc); // jae, unsigned
                }
                ebpf::JGE_REG    => {
                    self.emit_cmp(src, dst);
                    self.emit_jcc(0x83, target_pc);
                }
                ebpf::JSET_IMM   => {
                    self.emit_alu64_imm32(0xf7, 0, dst, insn.imm);
                    self.emit_jcc(0x85, target_pc); // jnz
                }
                ebpf::JSET_REG   => {
                    self.emit_alu64(0x85, src, dst);
                    self.emit_jcc(0x85, target_pc);
                }
                ebpf::JNE_IMM    => {
                    self.emit_cmp_imm32(dst, insn.imm);
                    self.emit_jcc(0x85, target_pc);
                }
                ebpf::JNE_REG    => {
                    self.emit_cmp(src, dst);
                    self.emit_jcc(0x85, target_pc);
                }
                ebpf::JSGT_IMM   => {
                    self.emit_cmp_imm32(dst, insn.imm);
                    self.emit_jcc(0x8f, target_pc); // jg, signed
                }
                ebpf::JSGT_REG   => {
                    self.emit_cmp(src, dst);
                    self.emit_jcc(0x8f, target_pc);
                }
                ebpf::JSGE_IMM   => {
                    self.emit_cmp_imm32(dst, insn.imm);
                    self.emit_jcc(0x8d, target_pc); // jge, signed
                }
                ebpf::JSGE_REG   => {
                    self.emit_cmp(src, dst);
                    self.emit_jcc(0x8d, target_pc);
                }

                ebpf::CALL       => {
                    // Helpers in use must be registered before compilation: the compiled
                    // program embeds the function address.
                    match helpers.get(insn.imm as usize).copied().flatten() {
                        Some(helper) => self.emit_helper_call(helper as usize),
                        None => return Err(EbpfError::UnknownHelper(insn.imm as u32, insn_ptr)),
                    }
                }
                ebpf::EXIT       => {
                    // The epilogue immediately follows the last instruction, so a trailing
                    // exit can simply fall through.
                    if insn_ptr != num_insns - 1 {
                        self.emit_jmp(TARGET_PC_EXIT);
                    }
                }

                opc => return Err(EbpfError::UnknownOpCode(opc, insn_ptr)),
            }

            insn_ptr += 1;
        }

        // Move register 0 into rax
        self.set_anchor(TARGET_PC_EXIT);
        if self.register_map.map(0) != RAX {
            self.emit_mov(self.register_map.map(0), RAX);
        }

        // Epilogue: deallocate stack space, then restore the callee-saved registers in the
        // reverse of the order the prologue pushed them.
        self.set_anchor(TARGET_PC_EPILOGUE);
        self.emit_alu64_imm32(0x81, 0, RSP, ebpf::STACK_SIZE as i32);
        self.emit_pop(R15);
        self.emit_pop(R14);
        self.emit_pop(R13);
        self.emit_pop(RBX);
        self.emit_pop(RBP);
        self.emit1(0xc3); // ret

        // Division-by-zero trampoline. The faulting PC was staged in RCX at the division
        // site; hand it to the reporter, make the program return -1 and leave through the
        // epilogue.
        self.set_anchor(TARGET_PC_DIV_BY_ZERO);
        self.emit_mov(RCX, RDI);
        self.emit_call(report_div_by_zero as usize);
        self.emit_load_imm(RAX, -1);
        self.emit_jmp(TARGET_PC_EPILOGUE);

        Ok(())
    }

    fn resolve_jumps(&mut self) {
        for jump in &self.jumps {
            let target_loc = match self.special_targets.get(&jump.target_pc) {
                Some(target) => *target,
                None => self.pc_locs[jump.target_pc as usize],
            };

            // Assumes the jump offset is at the end of the instruction
            let offset_loc = jump.offset_loc + mem::size_of::<i32>();
            let rel = (target_loc as isize - offset_loc as isize) as i32;
            LittleEndian::write_i32(&mut self.contents[jump.offset_loc..], rel);
        }
    }
}

fn round_to_page_size(value: usize, page_size: usize) -> usize {
    (value + page_size - 1) / page_size * page_size
}

fn libc_error(function: &'static str) -> EbpfError {
    EbpfError::LibcInvocationFailed(
        function,
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    )
}

/// Executable memory holding one JIT-compiled program.
///
/// The backing pages go through a write-then-execute cycle: mapped read-write, filled with the
/// encoded program, then flipped to read-execute. They are unmapped, with the same length, when
/// the value is dropped.
pub(crate) struct JitMemory {
    text: &'static mut [u8],
}

impl JitMemory {
    pub fn new(
        prog: &[u8],
        helpers: &[Option<ebpf::Helper>; ebpf::MAX_HELPERS],
        register_map: &RegisterMap,
    ) -> Result<JitMemory, EbpfError> {
        let mut jit = JitCompiler::new(prog.len() / ebpf::INSN_SIZE, register_map.clone());
        jit.jit_compile(prog, helpers)?;
        jit.resolve_jumps();

        let mem = JitMemory::protect(&jit.contents)?;
        debug!(
            "JIT compiled {} eBPF instructions into {} bytes of x86-64 code",
            prog.len() / ebpf::INSN_SIZE,
            jit.contents.len()
        );
        Ok(mem)
    }

    fn protect(code: &[u8]) -> Result<JitMemory, EbpfError> {
        unsafe {
            let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let size = round_to_page_size(code.len(), page_size);
            let raw = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                return Err(libc_error("mmap"));
            }
            ptr::copy_nonoverlapping(code.as_ptr(), raw as *mut u8, code.len());
            // Fill the tail of the last page with debugger traps
            ptr::write_bytes((raw as *mut u8).add(code.len()), 0xcc, size - code.len());
            if libc::mprotect(raw, size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = libc_error("mprotect");
                libc::munmap(raw, size);
                return Err(err);
            }
            Ok(JitMemory {
                text: std::slice::from_raw_parts_mut(raw as *mut u8, size),
            })
        }
    }

    pub fn get_prog(&self) -> MachineCode {
        unsafe { mem::transmute(self.text.as_ptr()) }
    }

    /// Address of the entry point, the base of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.text.as_ptr()
    }

    /// Length of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.text.len()
    }
}

impl Drop for JitMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.text.as_mut_ptr() as *mut _, self.text.len());
        }
    }
}

impl fmt::Debug for JitMemory {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        fmt.debug_struct("JitMemory")
            .field("base", &self.text.as_ptr())
            .field("size", &self.text.len())
            .finish()
    }
}
