// Converted from the tests for uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// These tests run each program twice, once through the interpreter and once JIT-compiled, and
// check that both produce the expected result. The interpreter is the reference the compiled
// code is held against.

extern crate ebpf_jit;

use ebpf_jit::{assembler::assemble, error::EbpfError, helpers, EbpfVm};

macro_rules! test_vm_and_jit_asm {
    ( $source:tt, $mem:tt, ($($location:expr => $helper:expr),* $(,)?), $expected:expr ) => {
        let program = assemble($source).unwrap();
        {
            let mut mem = $mem;
            #[allow(unused_mut)]
            let mut vm = EbpfVm::new(Some(&program)).unwrap();
            $(vm.register_helper($location, $helper).unwrap();)*
            assert_eq!(vm.execute_program(&mut mem).unwrap(), $expected);
        }
        {
            let mut mem = $mem;
            let mut vm = EbpfVm::new(Some(&program)).unwrap();
            $(vm.register_helper($location, $helper).unwrap();)*
            vm.jit_compile().unwrap();
            assert_eq!(unsafe { vm.execute_program_jit(&mut mem).unwrap() }, $expected);
        }
    };
}

// BPF_ALU class: arithmetic and logic

#[test]
fn test_vm_jit_mov() {
    test_vm_and_jit_asm!(
        "
        mov32 r1, 1
        mov32 r0, r1
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_mov32_imm_large() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, -1
        exit",
        [],
        (),
        0xffffffff
    );
}

#[test]
fn test_vm_jit_mov_large() {
    // A 32-bit register move zeroes the upper half of the destination.
    test_vm_and_jit_asm!(
        "
        mov32 r1, -1
        mov32 r0, r1
        exit",
        [],
        (),
        0xffffffff
    );
}

#[test]
fn test_vm_jit_bounce() {
    test_vm_and_jit_asm!(
        "
        mov r0, 1
        mov r6, r0
        mov r7, r6
        mov r8, r7
        mov r9, r8
        mov r0, r9
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_add32() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 0
        mov32 r1, 2
        add32 r0, 1
        add32 r0, r1
        exit",
        [],
        (),
        0x3
    );
}

#[test]
fn test_vm_jit_add64_wrap() {
    test_vm_and_jit_asm!(
        "
        mov64 r0, -1
        add64 r0, 1
        exit",
        [],
        (),
        0x0
    );
}

#[test]
fn test_vm_jit_neg32() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 2
        neg32 r0
        exit",
        [],
        (),
        0xfffffffe
    );
}

#[test]
fn test_vm_jit_neg64() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 2
        neg r0
        exit",
        [],
        (),
        0xfffffffffffffffe
    );
}

#[test]
fn test_vm_jit_alu32_arithmetic() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 0
        mov32 r1, 1
        mov32 r2, 2
        mov32 r3, 3
        mov32 r4, 4
        mov32 r5, 5
        mov32 r6, 6
        mov32 r7, 7
        mov32 r8, 8
        mov32 r9, 9
        add32 r0, 23
        add32 r0, r7
        sub32 r0, 13
        sub32 r0, r1
        mul32 r0, 7
        mul32 r0, r3
        div32 r0, 2
        div32 r0, r4
        exit",
        [],
        (),
        0x2a
    );
}

#[test]
fn test_vm_jit_alu64_arithmetic() {
    test_vm_and_jit_asm!(
        "
        mov r0, 0
        mov r1, 1
        mov r2, 2
        mov r3, 3
        mov r4, 4
        mov r5, 5
        mov r6, 6
        mov r7, 7
        mov r8, 8
        mov r9, 9
        add r0, 23
        add r0, r7
        sub r0, 13
        sub r0, r1
        mul r0, 7
        mul r0, r3
        div r0, 2
        div r0, r4
        exit",
        [],
        (),
        0x2a
    );
}

#[test]
fn test_vm_jit_alu32_logic() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 0
        mov32 r1, 1
        mov32 r2, 2
        mov32 r3, 3
        mov32 r4, 4
        mov32 r5, 5
        mov32 r6, 6
        mov32 r7, 7
        mov32 r8, 8
        or32 r0, r5
        or32 r0, 0xa0
        and32 r0, 0xa3
        mov32 r9, 0x91
        and32 r0, r9
        lsh32 r0, 22
        lsh32 r0, r8
        rsh32 r0, 19
        rsh32 r0, r7
        xor32 r0, 0x03
        xor32 r0, r2
        exit",
        [],
        (),
        0x11
    );
}

#[test]
fn test_vm_jit_arsh32() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 8
        lsh32 r0, 28
        arsh32 r0, 16
        exit",
        [],
        (),
        0xffff8000
    );
}

#[test]
fn test_vm_jit_arsh32_reg() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 8
        mov32 r1, 16
        lsh32 r0, 28
        arsh32 r0, r1
        exit",
        [],
        (),
        0xffff8000
    );
}

#[test]
fn test_vm_jit_arsh64() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 1
        lsh r0, 63
        arsh r0, 55
        mov32 r1, 5
        arsh r0, r1
        exit",
        [],
        (),
        0xfffffffffffffff8
    );
}

#[test]
fn test_vm_jit_lsh64_reg() {
    test_vm_and_jit_asm!(
        "
        mov r0, 0x1
        mov r7, 4
        lsh r0, r7
        exit",
        [],
        (),
        0x10
    );
}

#[test]
fn test_vm_jit_rsh64_reg() {
    test_vm_and_jit_asm!(
        "
        mov r0, 0x10
        mov r7, 4
        rsh r0, r7
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_rsh32_zero_extends_first() {
    // The 32-bit shift operates on the truncated value, not the full register.
    test_vm_and_jit_asm!(
        "
        mov r0, -1
        rsh32 r0, 8
        exit",
        [],
        (),
        0x00ffffff
    );
}

// Multiplication, division, modulo

#[test]
fn test_vm_jit_mul32_imm() {
    test_vm_and_jit_asm!(
        "
        mov r0, 3
        mul32 r0, 4
        exit",
        [],
        (),
        0xc
    );
}

#[test]
fn test_vm_jit_mul32_reg_overflow() {
    // The result is truncated to 32 bits and zero-extended.
    test_vm_and_jit_asm!(
        "
        mov r0, 0x40000001
        mov r1, 4
        mul32 r0, r1
        exit",
        [],
        (),
        0x4
    );
}

#[test]
fn test_vm_jit_mul64_wrap() {
    test_vm_and_jit_asm!(
        "
        mov r0, -1
        mul r0, 2
        exit",
        [],
        (),
        0xfffffffffffffffe
    );
}

#[test]
fn test_vm_jit_div32_truncates() {
    // Only the lower 32 bits of the dividend take part in a 32-bit division.
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x100000004
        div32 r0, 2
        exit",
        [],
        (),
        0x2
    );
}

#[test]
fn test_vm_jit_div64_unsigned() {
    // eBPF divisions are unsigned: -1 is the largest u64, not a negative number.
    test_vm_and_jit_asm!(
        "
        mov r0, -1
        div r0, 2
        exit",
        [],
        (),
        0x7fffffffffffffff
    );
}

#[test]
fn test_vm_jit_div64_reg() {
    test_vm_and_jit_asm!(
        "
        mov r0, 13
        mov r1, 4
        div r0, r1
        exit",
        [],
        (),
        0x3
    );
}

#[test]
fn test_vm_jit_div_dst_rdx_assignment() {
    // r3 lives in RDX by default, one of the implicit operands of the division.
    test_vm_and_jit_asm!(
        "
        mov r3, 13
        div r3, 4
        mov r0, r3
        exit",
        [],
        (),
        0x3
    );
}

#[test]
fn test_vm_jit_mod32() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 5748
        mod32 r0, 92
        mov32 r1, 13
        mod32 r0, r1
        exit",
        [],
        (),
        0x5
    );
}

#[test]
fn test_vm_jit_mod64() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x100000003
        mod r0, 3
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_div64_by_zero() {
    // The program returns -1 and one diagnostic line goes to stderr.
    test_vm_and_jit_asm!(
        "
        mov r0, 10
        mov r1, 0
        div r0, r1
        exit",
        [],
        (),
        u64::MAX
    );
}

#[test]
fn test_vm_jit_div32_by_zero_reg() {
    test_vm_and_jit_asm!(
        "
        mov r0, 10
        mov r1, 0
        div32 r0, r1
        exit",
        [],
        (),
        u64::MAX
    );
}

#[test]
fn test_vm_jit_mod64_by_zero_reg() {
    test_vm_and_jit_asm!(
        "
        mov r0, 10
        mov r1, 0
        mod r0, r1
        exit",
        [],
        (),
        u64::MAX
    );
}

#[test]
fn test_vm_jit_div_by_zero_divisor_only_truncated() {
    // The 64-bit divisor is not zero even though its lower half is.
    test_vm_and_jit_asm!(
        "
        mov r0, 4
        lddw r1, 0x100000000
        div r0, r1
        exit",
        [],
        (),
        0x0
    );
}

// Endianness conversions

#[test]
fn test_vm_jit_be16() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x1122334455667788
        be16 r0
        exit",
        [],
        (),
        0x8877
    );
}

#[test]
fn test_vm_jit_be32() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x1122334455667788
        be32 r0
        exit",
        [],
        (),
        0x88776655
    );
}

#[test]
fn test_vm_jit_be64() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x1122334455667788
        be64 r0
        exit",
        [],
        (),
        0x8877665544332211
    );
}

#[test]
fn test_vm_jit_be_high_register() {
    // r9 lives in R15; byte swapping must work on the extended registers too.
    test_vm_and_jit_asm!(
        "
        lddw r9, 0x1122334455667788
        be32 r9
        mov r0, r9
        exit",
        [],
        (),
        0x88776655
    );
}

#[test]
fn test_vm_jit_le_is_a_no_op() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x1122334455667788
        le16 r0
        le32 r0
        le64 r0
        exit",
        [],
        (),
        0x1122334455667788
    );
}

// Wide immediate loads

#[test]
fn test_vm_jit_lddw() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x1122334455667788
        exit",
        [],
        (),
        0x1122334455667788
    );
}

#[test]
fn test_vm_jit_lddw_zero_extends_lower_half() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x0000000080000000
        exit",
        [],
        (),
        0x80000000
    );
}

#[test]
fn test_vm_jit_lddw_negative_upper_half() {
    test_vm_and_jit_asm!(
        "
        lddw r0, 0x8000000000000000
        exit",
        [],
        (),
        0x8000000000000000
    );
}

// Branches

#[test]
fn test_vm_jit_ja() {
    test_vm_and_jit_asm!(
        "
        mov r0, 1
        ja +1
        mov r0, 2
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_jgt_unsigned_takes_branch() {
    // -1 compares as the largest u64.
    test_vm_and_jit_asm!(
        "
        mov64 r0, 0
        mov64 r1, -1
        jgt r1, 0, +1
        mov64 r0, 7
        exit",
        [],
        (),
        0x0
    );
}

#[test]
fn test_vm_jit_jsgt_signed_falls_through() {
    test_vm_and_jit_asm!(
        "
        mov64 r0, 0
        mov64 r1, -1
        jsgt r1, 0, +1
        mov64 r0, 7
        exit",
        [],
        (),
        0x7
    );
}

#[test]
fn test_vm_jit_jeq_imm_and_reg() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 0
        mov32 r1, 0xa
        jeq r1, 0xb, +4
        mov32 r0, 1
        mov32 r1, 0xb
        mov32 r2, 0xb
        jeq r1, r2, +1
        mov32 r0, 2
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_jne_reg() {
    test_vm_and_jit_asm!(
        "
        mov32 r0, 0
        mov32 r1, 0xb
        mov32 r2, 0xb
        jne r1, r2, +4
        mov32 r0, 1
        mov32 r1, 0xa
        jne r1, r2, +1
        mov32 r0, 2
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_jge_jsge() {
    test_vm_and_jit_asm!(
        "
        mov r0, 0
        mov r1, -2
        jge r1, 1, +1
        ja +1
        add r0, 1
        jsge r1, 1, +2
        add r0, 2
        exit
        mov r0, 99
        exit",
        [],
        (),
        0x3
    );
}

#[test]
fn test_vm_jit_jset() {
    test_vm_and_jit_asm!(
        "
        mov r0, 0
        mov r1, 0x8
        jset r1, 0x9, +1
        exit
        mov r0, 1
        jset r1, 0x4, +1
        exit
        mov r0, 2
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_jset_sign_extends_imm() {
    // test r/m64, imm32 sign-extends its immediate, so bit 63 is covered by -1.
    test_vm_and_jit_asm!(
        "
        mov r0, 0
        mov r1, 1
        lsh r1, 63
        jset r1, -1, +1
        exit
        mov r0, 1
        exit",
        [],
        (),
        0x1
    );
}

#[test]
fn test_vm_jit_early_exit() {
    // An exit in the middle of the program leaves through the shared epilogue.
    test_vm_and_jit_asm!(
        "
        mov r0, 3
        jeq r1, 1, +1
        exit
        mov r0, 4
        exit",
        [],
        (),
        0x3
    );
}

// Memory access

#[test]
fn test_vm_jit_ldxb() {
    test_vm_and_jit_asm!(
        "
        ldxb r0, [r1+2]
        exit",
        [0xaa, 0xbb, 0x11, 0xcc, 0xdd],
        (),
        0x11
    );
}

#[test]
fn test_vm_jit_ldxb_zero_extends() {
    test_vm_and_jit_asm!(
        "
        mov64 r0, -1
        ldxb r0, [r1]
        exit",
        [0xff],
        (),
        0xff
    );
}

#[test]
fn test_vm_jit_ldxh_zero_extends() {
    test_vm_and_jit_asm!(
        "
        mov64 r0, -1
        ldxh r0, [r1]
        exit",
        [0xff, 0xff],
        (),
        0xffff
    );
}

#[test]
fn test_vm_jit_ldxw() {
    test_vm_and_jit_asm!(
        "
        ldxw r0, [r1+2]
        exit",
        [0xaa, 0xbb, 0x11, 0x22, 0x33, 0x44, 0xcc, 0xdd],
        (),
        0x44332211
    );
}

#[test]
fn test_vm_jit_ldxw_zero_extends() {
    test_vm_and_jit_asm!(
        "
        mov64 r0, -1
        ldxw r0, [r1]
        exit",
        [0xff, 0xff, 0xff, 0xff],
        (),
        0xffffffff
    );
}

#[test]
fn test_vm_jit_ldxdw() {
    test_vm_and_jit_asm!(
        "
        ldxdw r0, [r1+2]
        exit",
        [
            0xaa, 0xbb, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, //
            0x77, 0x88, 0xcc, 0xdd, //
        ],
        (),
        0x8877665544332211
    );
}

#[test]
fn test_vm_jit_st() {
    test_vm_and_jit_asm!(
        "
        stb [r1+2], 0x11
        sth [r1+4], 0x2233
        stw [r1+6], 0x44556677
        ldxb r0, [r1+2]
        ldxh r2, [r1+4]
        add r0, r2
        ldxw r2, [r1+6]
        add r0, r2
        exit",
        [0xaa, 0xbb, 0xff, 0xcc, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xdd],
        (),
        0x11 + 0x2233 + 0x44556677
    );
}

#[test]
fn test_vm_jit_stdw_sign_extends_imm() {
    test_vm_and_jit_asm!(
        "
        stdw [r10-8], -1
        ldxdw r0, [r10-8]
        exit",
        [],
        (),
        0xffffffffffffffff
    );
}

#[test]
fn test_vm_jit_stx() {
    test_vm_and_jit_asm!(
        "
        mov32 r2, -1
        stxb [r1], r2
        stxh [r1+1], r2
        stxw [r1+3], r2
        stxdw [r1+7], r2
        ldxdw r0, [r1+7]
        exit",
        [0; 16],
        (),
        0xffffffff
    );
}

#[test]
fn test_vm_jit_stxb_high_register() {
    // r8 lives in R14, whose byte form needs a REX prefix to be addressable.
    test_vm_and_jit_asm!(
        "
        mov32 r8, 0x11
        stxb [r1], r8
        ldxb r0, [r1]
        exit",
        [0xff],
        (),
        0x11
    );
}

#[test]
fn test_vm_jit_stack() {
    test_vm_and_jit_asm!(
        "
        mov r1, 51
        stdw [r10-16], 0xab
        stxdw [r10-8], r1
        ldxdw r0, [r10-16]
        ldxdw r1, [r10-8]
        add r0, r1
        exit",
        [],
        (),
        0xab + 51
    );
}

#[test]
fn test_vm_jit_stack_all_widths() {
    test_vm_and_jit_asm!(
        "
        stb [r10-1], 0x11
        sth [r10-4], 0x22
        stw [r10-8], 0x33
        stdw [r10-16], 0x44
        ldxb r0, [r10-1]
        ldxh r1, [r10-4]
        add r0, r1
        ldxw r1, [r10-8]
        add r0, r1
        ldxdw r1, [r10-16]
        add r0, r1
        exit",
        [],
        (),
        0x11 + 0x22 + 0x33 + 0x44
    );
}

// Helper calls

#[test]
fn test_vm_jit_call() {
    test_vm_and_jit_asm!(
        "
        mov r1, 1
        mov r2, 2
        mov r3, 3
        mov r4, 4
        mov r5, 5
        call 0
        exit",
        [],
        (0 => helpers::gather_bytes),
        0x0102030405
    );
}

#[test]
fn test_vm_jit_call_memfrob() {
    test_vm_and_jit_asm!(
        "
        mov r6, r1
        add r1, 2
        mov r2, 4
        call 1
        ldxdw r0, [r6]
        be64 r0
        exit",
        [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
        ],
        (1 => helpers::memfrob),
        0x102292e2f2c0708
    );
}

#[test]
fn test_vm_jit_call_preserves_scratch_registers() {
    // r6 to r9 survive helper calls, like the System V callee-saved registers they live in.
    test_vm_and_jit_asm!(
        "
        mov r6, 0x11
        mov r7, 0x22
        mov r8, 0x33
        mov r9, 0x44
        mov r1, 0
        mov r2, 0
        mov r3, 0
        mov r4, 0
        mov r5, 0
        call 0
        mov r0, r6
        add r0, r7
        add r0, r8
        add r0, r9
        exit",
        [],
        (0 => helpers::gather_bytes),
        0x11 + 0x22 + 0x33 + 0x44
    );
}

#[test]
fn test_vm_jit_sqrti() {
    test_vm_and_jit_asm!(
        "
        mov32 r1, 9
        call 1
        exit",
        [],
        (1 => helpers::sqrti),
        3
    );
}

// Scenario: the identity function. The input memory pointer arrives in r1; returning it
// unchanged lets the test observe the value that crossed the call boundary.

#[test]
fn test_vm_jit_identity() {
    let program = assemble(
        "
        mov64 r0, r1
        exit",
    )
    .unwrap();
    let mut mem = [42u8; 4];
    let expected = mem.as_ptr() as u64;

    let vm = EbpfVm::new(Some(&program)).unwrap();
    assert_eq!(vm.execute_program(&mut mem).unwrap(), expected);

    let mut vm = EbpfVm::new(Some(&program)).unwrap();
    vm.jit_compile().unwrap();
    assert_eq!(unsafe { vm.execute_program_jit(&mut mem).unwrap() }, expected);
}

// Register map permutations: any rotation or shuffle of the register assignment must compile
// to an observably equivalent program.

#[test]
fn test_vm_jit_register_offset_permutations() {
    let program = assemble(
        "
        mov64 r0, 0
        mov64 r1, 1
        mov64 r2, 2
        mov64 r3, 3
        mov64 r4, 4
        mov64 r5, 5
        mov64 r6, 6
        mov64 r7, 7
        mov64 r8, 8
        mov64 r9, 9
        add64 r0, r1
        add64 r0, r2
        add64 r0, r3
        add64 r0, r4
        add64 r0, r5
        add64 r0, r6
        add64 r0, r7
        add64 r0, r8
        add64 r0, r9
        lsh64 r0, 2
        div64 r0, r3
        mod64 r0, r7
        mul64 r0, r8
        sub64 r0, r9
        stxdw [r10-8], r0
        ldxdw r0, [r10-8]
        jne r0, 23, +2
        mov64 r0, 1
        exit
        mov64 r0, 0
        exit",
    )
    .unwrap();

    let reference = EbpfVm::new(Some(&program))
        .unwrap()
        .execute_program(&mut [])
        .unwrap();
    assert_eq!(reference, 1);

    for offset in [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 1234, 0xdead_beef] {
        let mut vm = EbpfVm::new(Some(&program)).unwrap();
        vm.set_register_offset(offset).unwrap();
        vm.jit_compile().unwrap();
        assert_eq!(
            unsafe { vm.execute_program_jit(&mut []).unwrap() },
            reference,
            "offset {}",
            offset
        );
    }
}

// Compilation life cycle

#[test]
fn test_vm_jit_compile_is_idempotent() {
    let program = assemble(
        "
        mov64 r0, 42
        exit",
    )
    .unwrap();
    let mut vm = EbpfVm::new(Some(&program)).unwrap();
    vm.jit_compile().unwrap();
    let first = vm.get_jitted_code().unwrap();
    vm.jit_compile().unwrap();
    let second = vm.get_jitted_code().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_vm_jit_not_compiled() {
    let program = assemble(
        "
        mov64 r0, 42
        exit",
    )
    .unwrap();
    let vm = EbpfVm::new(Some(&program)).unwrap();
    assert_eq!(
        unsafe { vm.execute_program_jit(&mut []) },
        Err(EbpfError::JitNotCompiled)
    );
}

#[test]
fn test_vm_jit_register_offset_after_compile() {
    let program = assemble(
        "
        mov64 r0, 42
        exit",
    )
    .unwrap();
    let mut vm = EbpfVm::new(Some(&program)).unwrap();
    vm.jit_compile().unwrap();
    assert_eq!(
        vm.set_register_offset(3),
        Err(EbpfError::JitAlreadyCompiled)
    );
}

#[test]
fn test_vm_jit_unknown_helper_is_a_compile_error() {
    let program = assemble(
        "
        call 63
        exit",
    )
    .unwrap();
    let mut vm = EbpfVm::new(Some(&program)).unwrap();
    assert_eq!(vm.jit_compile(), Err(EbpfError::UnknownHelper(63, 0)));
}

#[test]
fn test_vm_jit_unknown_opcode_diagnostic() {
    fn tautology(_prog: &[u8]) -> Result<(), EbpfError> {
        Ok(())
    }

    // Class 6 is unused by the instruction set; only a pass-all verifier lets it through.
    let prog = &[
        0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    ];
    let mut vm = EbpfVm::new(None).unwrap();
    vm.set_verifier(tautology).unwrap();
    vm.set_program(prog).unwrap();
    let err = vm.jit_compile().unwrap_err();
    assert_eq!(err, EbpfError::UnknownOpCode(0x06, 0));
    assert_eq!(err.to_string(), "unknown opcode 0x06 at PC 0");
}

#[test]
fn test_vm_no_program() {
    let vm = EbpfVm::new(None).unwrap();
    assert_eq!(
        vm.execute_program(&mut []),
        Err(EbpfError::NothingToExecute)
    );
}
