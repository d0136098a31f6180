//! eBPF instruction builder.
//!
//! The tracepoint program is composed at runtime because the field
//! offsets it reads come from the running kernel's BTF. This module is a
//! small assembler: typed emit methods, symbolic labels, and a resolve
//! pass that turns labels into relative jump offsets.

use std::os::fd::RawFd;

use thiserror::Error;

/// One 64-bit eBPF instruction, laid out as the kernel's `struct bpf_insn`:
/// opcode, dst/src register nibbles, signed 16-bit offset, 32-bit immediate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub code: u8,
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    /// Read-only frame pointer.
    R10,
}

impl Reg {
    fn num(self) -> u8 {
        match self {
            Reg::R0 => 0,
            Reg::R1 => 1,
            Reg::R2 => 2,
            Reg::R3 => 3,
            Reg::R4 => 4,
            Reg::R5 => 5,
            Reg::R6 => 6,
            Reg::R7 => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
        }
    }
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Byte,
    Half,
    Word,
    Double,
}

impl Size {
    fn code(self) -> u8 {
        match self {
            Size::Word => 0x00,
            Size::Half => 0x08,
            Size::Byte => 0x10,
            Size::Double => 0x18,
        }
    }
}

/// Helper function ids from `<linux/bpf.h>`.
pub mod helpers {
    pub const MAP_UPDATE_ELEM: i32 = 2;
    pub const GET_CURRENT_PID_TGID: i32 = 14;
}

// Opcode classes and operation bits.
const BPF_LD: u8 = 0x00;
const BPF_LDX: u8 = 0x01;
const BPF_ST: u8 = 0x02;
const BPF_STX: u8 = 0x03;
const BPF_JMP: u8 = 0x05;
const BPF_ALU64: u8 = 0x07;

const BPF_MEM: u8 = 0x60;
const BPF_IMM: u8 = 0x00;

const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;

const BPF_ADD: u8 = 0x00;
const BPF_MOV: u8 = 0xb0;
const BPF_RSH: u8 = 0x70;

const BPF_JA: u8 = 0x00;
const BPF_JEQ: u8 = 0x10;
const BPF_JNE: u8 = 0x50;
const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

/// Source register value marking an `ld_imm64` as a map-fd load.
const BPF_PSEUDO_MAP_FD: u8 = 1;

#[derive(Debug, Error)]
pub enum InsnError {
    #[error("jump references a label that was never bound")]
    UnboundLabel,

    #[error("jump offset out of i16 range")]
    JumpOutOfRange,
}

/// Opaque jump target handle, valid for the builder that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Default)]
pub struct ProgramBuilder {
    insns: Vec<Insn>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.insns.len());
    }

    fn push(&mut self, code: u8, dst: Reg, src: Reg, off: i16, imm: i32) {
        self.insns.push(Insn {
            code,
            regs: dst.num() | (src.num() << 4),
            off,
            imm,
        });
    }

    /// dst = src
    pub fn mov_reg(&mut self, dst: Reg, src: Reg) {
        self.push(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0);
    }

    /// dst = imm
    pub fn mov_imm(&mut self, dst: Reg, imm: i32) {
        self.push(BPF_ALU64 | BPF_MOV | BPF_K, dst, Reg::R0, 0, imm);
    }

    /// dst += imm
    pub fn add_imm(&mut self, dst: Reg, imm: i32) {
        self.push(BPF_ALU64 | BPF_ADD | BPF_K, dst, Reg::R0, 0, imm);
    }

    /// dst >>= imm (logical)
    pub fn rsh_imm(&mut self, dst: Reg, imm: i32) {
        self.push(BPF_ALU64 | BPF_RSH | BPF_K, dst, Reg::R0, 0, imm);
    }

    /// dst = *(size *)(src + off)
    pub fn load(&mut self, size: Size, dst: Reg, src: Reg, off: i16) {
        self.push(BPF_LDX | BPF_MEM | size.code(), dst, src, off, 0);
    }

    /// *(size *)(dst + off) = src
    pub fn store(&mut self, size: Size, dst: Reg, off: i16, src: Reg) {
        self.push(BPF_STX | BPF_MEM | size.code(), dst, src, off, 0);
    }

    /// *(size *)(dst + off) = imm
    pub fn store_imm(&mut self, size: Size, dst: Reg, off: i16, imm: i32) {
        self.push(BPF_ST | BPF_MEM | size.code(), dst, Reg::R0, off, imm);
    }

    /// if reg == imm goto target
    pub fn jump_eq_imm(&mut self, reg: Reg, imm: i32, target: Label) {
        self.fixups.push((self.insns.len(), target));
        self.push(BPF_JMP | BPF_JEQ | BPF_K, reg, Reg::R0, 0, imm);
    }

    /// if reg != imm goto target
    pub fn jump_ne_imm(&mut self, reg: Reg, imm: i32, target: Label) {
        self.fixups.push((self.insns.len(), target));
        self.push(BPF_JMP | BPF_JNE | BPF_K, reg, Reg::R0, 0, imm);
    }

    /// goto target
    pub fn jump(&mut self, target: Label) {
        self.fixups.push((self.insns.len(), target));
        self.push(BPF_JMP | BPF_JA, Reg::R0, Reg::R0, 0, 0);
    }

    /// Call a kernel helper by id.
    pub fn call(&mut self, helper: i32) {
        self.push(BPF_JMP | BPF_CALL, Reg::R0, Reg::R0, 0, helper);
    }

    /// dst = map referenced by `fd`. Emits the two-slot `ld_imm64` form;
    /// the verifier rewrites the fd into a map pointer at load time.
    pub fn load_map_fd(&mut self, dst: Reg, fd: RawFd) {
        self.insns.push(Insn {
            code: BPF_LD | BPF_IMM | Size::Double.code(),
            regs: dst.num() | (BPF_PSEUDO_MAP_FD << 4),
            off: 0,
            imm: fd,
        });
        self.insns.push(Insn { code: 0, regs: 0, off: 0, imm: 0 });
    }

    pub fn exit(&mut self) {
        self.push(BPF_JMP | BPF_EXIT, Reg::R0, Reg::R0, 0, 0);
    }

    /// Resolve labels into relative jump offsets and return the program.
    pub fn build(mut self) -> Result<Vec<Insn>, InsnError> {
        for (site, label) in &self.fixups {
            let target = self.labels[label.0].ok_or(InsnError::UnboundLabel)?;
            let rel = target as i64 - *site as i64 - 1;
            let rel = i16::try_from(rel).map_err(|_| InsnError::JumpOutOfRange)?;
            self.insns[*site].off = rel;
        }
        Ok(self.insns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insn_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<Insn>(), 8);
    }

    #[test]
    fn test_forward_jump_resolution() {
        let mut p = ProgramBuilder::new();
        let out = p.new_label();
        p.mov_imm(Reg::R0, 0); // 0
        p.jump_eq_imm(Reg::R1, 2, out); // 1
        p.mov_imm(Reg::R0, 1); // 2
        p.bind(out);
        p.exit(); // 3
        let insns = p.build().unwrap();
        // Jump at index 1 skips one instruction to land on index 3.
        assert_eq!(insns[1].off, 1);
    }

    #[test]
    fn test_backward_jump_resolution() {
        let mut p = ProgramBuilder::new();
        let top = p.new_label();
        p.bind(top);
        p.mov_imm(Reg::R0, 0); // 0
        p.jump(top); // 1 -> off = 0 - 1 - 1 = -2
        let insns = p.build().unwrap();
        assert_eq!(insns[1].off, -2);
    }

    #[test]
    fn test_unbound_label_is_rejected() {
        let mut p = ProgramBuilder::new();
        let nowhere = p.new_label();
        p.jump(nowhere);
        assert!(matches!(p.build(), Err(InsnError::UnboundLabel)));
    }

    #[test]
    fn test_load_map_fd_takes_two_slots() {
        let mut p = ProgramBuilder::new();
        p.load_map_fd(Reg::R1, 7);
        p.exit();
        let insns = p.build().unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].code, 0x18);
        assert_eq!(insns[0].regs, 1 | (1 << 4));
        assert_eq!(insns[0].imm, 7);
        assert_eq!(insns[1], Insn { code: 0, regs: 0, off: 0, imm: 0 });
    }

    #[test]
    fn test_register_encoding() {
        let mut p = ProgramBuilder::new();
        p.mov_reg(Reg::R6, Reg::R1);
        let insns = p.build().unwrap();
        assert_eq!(insns[0].code, 0xbf);
        assert_eq!(insns[0].regs, 6 | (1 << 4));
    }

    #[test]
    fn test_store_load_encoding() {
        let mut p = ProgramBuilder::new();
        p.load(Size::Half, Reg::R2, Reg::R6, 12);
        p.store(Size::Word, Reg::R10, -32, Reg::R4);
        p.store_imm(Size::Word, Reg::R10, -20, 0);
        p.load(Size::Byte, Reg::R3, Reg::R6, 1);
        p.load(Size::Double, Reg::R4, Reg::R6, 0);
        let insns = p.build().unwrap();
        assert_eq!(insns[0].code, 0x69);
        assert_eq!(insns[1].code, 0x63);
        assert_eq!(insns[2].code, 0x62);
        assert_eq!(insns[1].off, -32);
        assert_eq!(insns[3].code, 0x71);
        assert_eq!(insns[4].code, 0x79);
    }
}
