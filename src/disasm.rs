//! Capstone-based x86-64 instruction source.
//!
//! The rest of the driver never touches capstone types: each decoded
//! instruction is copied into a driver-owned [`Instruction`] descriptor
//! with optional operand/group detail.

use std::fmt;
use std::str::FromStr;

use capstone::arch::x86::{ArchMode as X86Mode, ArchSyntax as X86Syntax, X86OperandType};
use capstone::arch::{ArchOperand, BuildsCapstone, BuildsCapstoneSyntax};
use capstone::{Capstone, InsnGroupType, RegId};

use crate::{Error, Result, MAX_INSTRUCTION_SIZE};

/// Assembly syntax selection for decoded operand strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Syntax {
    /// AT&T syntax (default).
    #[default]
    Att,
    /// Intel syntax.
    Intel,
}

impl fmt::Display for Syntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Syntax::Att => write!(f, "ATT"),
            Syntax::Intel => write!(f, "intel"),
        }
    }
}

impl FromStr for Syntax {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ATT" => Ok(Syntax::Att),
            "intel" => Ok(Syntax::Intel),
            _ => Err(format!(
                "bad syntax \"{}\"; expected \"ATT\" or \"intel\"",
                s
            )),
        }
    }
}

/// Memory operand decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemOperand {
    pub segment: Option<String>,
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: i32,
    pub disp: i64,
}

/// Operand payload by operand class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandKind {
    Imm(i64),
    Reg(String),
    Mem(MemOperand),
}

/// One decoded operand with its access mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Operand width in bytes.
    pub size: u8,
    pub read: bool,
    pub write: bool,
}

impl Operand {
    /// Immediate operands are always considered readable.
    pub fn readable(&self) -> bool {
        self.read || matches!(self.kind, OperandKind::Imm(_))
    }

    /// Numeric operand-class code: imm=1, reg=2, mem=3.
    pub fn type_code(&self) -> i64 {
        match self.kind {
            OperandKind::Imm(_) => 1,
            OperandKind::Reg(_) => 2,
            OperandKind::Mem(_) => 3,
        }
    }
}

/// Structured instruction detail, present when detail mode is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detail {
    pub operands: Vec<Operand>,
    pub is_call: bool,
    pub is_jump: bool,
    pub is_ret: bool,
}

/// One decoded instruction, owned by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Virtual address of the instruction.
    pub addr: u64,
    /// Offset relative to the start of the code section.
    pub offset: u64,
    /// Size of the instruction in bytes.
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add").
    pub mnemonic: String,
    /// Instruction operands as string representation.
    pub op_str: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE).
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    /// Operand/group detail, when the disassembler runs in detail mode.
    pub detail: Option<Detail>,
}

impl Instruction {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Full assembly string: the mnemonic, plus the operand string if any.
    pub fn assembly(&self) -> String {
        if self.op_str.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.op_str)
        }
    }

    /// True for data pseudo-instructions emitted on decode failure.
    pub fn is_data(&self) -> bool {
        self.mnemonic.starts_with('.')
    }

    pub fn is_call(&self) -> bool {
        self.detail.as_ref().map_or(false, |d| d.is_call)
    }

    pub fn is_jump(&self) -> bool {
        self.detail.as_ref().map_or(false, |d| d.is_jump)
    }

    pub fn is_ret(&self) -> bool {
        self.detail.as_ref().map_or(false, |d| d.is_ret)
    }

    /// Branch/call target address, or -1 when there is none (returns,
    /// indirect control flow, non-branches).
    pub fn target(&self) -> i64 {
        if self.is_call() || self.is_jump() {
            if let Some(detail) = &self.detail {
                for op in &detail.operands {
                    if let OperandKind::Imm(imm) = op.kind {
                        return imm;
                    }
                }
            }
        }
        -1
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.assembly())
    }
}

/// x86-64 disassembler handle.
pub struct Disassembler {
    cs: Capstone,
    detail: bool,
}

impl Disassembler {
    /// Build a 64-bit x86 decoder with the given syntax. Detail mode is
    /// only enabled when some rule or argument needs operand or group
    /// information.
    pub fn new(syntax: Syntax, detail: bool) -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(X86Mode::Mode64)
            .syntax(match syntax {
                Syntax::Att => X86Syntax::Att,
                Syntax::Intel => X86Syntax::Intel,
            })
            .detail(detail)
            .build()
            .map_err(|e| Error::Disasm(format!("(capstone): {}", e)))?;
        Ok(Disassembler { cs, detail })
    }

    /// Decode one instruction at byte position `pos` of `code`, where
    /// `code` starts at virtual address `base_addr`.
    ///
    /// Undecodable bytes yield a one-byte `.byte` data pseudo-instruction,
    /// so linear iteration always reaches the end of the section; the
    /// pipeline decides whether that is fatal.
    pub fn decode_at(&self, code: &[u8], pos: usize, base_addr: u64) -> Result<Instruction> {
        if pos >= code.len() {
            return Err(Error::Disasm(format!(
                "instruction at offset {:#x}; offset is outside the code section",
                pos
            )));
        }
        let end = usize::min(pos + MAX_INSTRUCTION_SIZE, code.len());
        let window = &code[pos..end];
        let addr = base_addr + pos as u64;

        let insns = self
            .cs
            .disasm_count(window, addr, 1)
            .map_err(|e| Error::Disasm(format!("instruction at {:#x}: {}", addr, e)))?;
        let insn = match insns.iter().next() {
            Some(insn) if insn.address() == addr => insn,
            _ => return Ok(Self::data_byte(window[0], pos, addr)),
        };

        let size = insn.bytes().len();
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        bytes[..size].copy_from_slice(insn.bytes());

        let detail = if self.detail {
            Some(self.extract_detail(insn)?)
        } else {
            None
        };

        Ok(Instruction {
            addr,
            offset: pos as u64,
            size: size as u8,
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            op_str: insn.op_str().unwrap_or("").to_string(),
            bytes,
            detail,
        })
    }

    /// Linear iterator over a whole code section.
    pub fn iter<'a>(&'a self, code: &'a [u8], base_addr: u64) -> InstructionSource<'a> {
        InstructionSource {
            dis: self,
            code,
            base_addr,
            pos: 0,
        }
    }

    fn data_byte(byte: u8, pos: usize, addr: u64) -> Instruction {
        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        bytes[0] = byte;
        Instruction {
            addr,
            offset: pos as u64,
            size: 1,
            mnemonic: ".byte".to_string(),
            op_str: format!("{:#04x}", byte),
            bytes,
            detail: None,
        }
    }

    fn reg_name(&self, reg: RegId) -> Option<String> {
        if reg == RegId(0) {
            None
        } else {
            self.cs.reg_name(reg)
        }
    }

    fn extract_detail(&self, insn: &capstone::Insn) -> Result<Detail> {
        let cs_detail = self
            .cs
            .insn_detail(insn)
            .map_err(|e| Error::Disasm(format!("instruction detail: {}", e)))?;

        let mut detail = Detail::default();
        for group in cs_detail.groups() {
            match group.0 as u32 {
                g if g == InsnGroupType::CS_GRP_CALL as u32 => detail.is_call = true,
                g if g == InsnGroupType::CS_GRP_JUMP as u32 => detail.is_jump = true,
                g if g == InsnGroupType::CS_GRP_RET as u32 => detail.is_ret = true,
                _ => {}
            }
        }

        for op in cs_detail.arch_detail().operands() {
            let ArchOperand::X86Operand(op) = op else {
                continue;
            };
            let (read, write) = match op.access {
                Some(access) => (access.is_readable(), access.is_writable()),
                None => (false, false),
            };
            let kind = match op.op_type {
                X86OperandType::Imm(imm) => OperandKind::Imm(imm),
                X86OperandType::Reg(reg) => {
                    OperandKind::Reg(self.reg_name(reg).unwrap_or_default())
                }
                X86OperandType::Mem(mem) => OperandKind::Mem(MemOperand {
                    segment: self.reg_name(mem.segment()),
                    base: self.reg_name(mem.base()),
                    index: self.reg_name(mem.index()),
                    scale: mem.scale(),
                    disp: mem.disp(),
                }),
                X86OperandType::Invalid => continue,
            };
            detail.operands.push(Operand {
                kind,
                size: op.size,
                read,
                write,
            });
        }
        Ok(detail)
    }
}

/// Linear instruction iterator: decodes from the start of a code slice to
/// its end, one instruction at a time.
pub struct InstructionSource<'a> {
    dis: &'a Disassembler,
    code: &'a [u8],
    base_addr: u64,
    pos: usize,
}

impl InstructionSource<'_> {
    /// Current byte position within the code slice.
    pub fn pos(&self) -> usize {
        self.pos
    }
}

impl Iterator for InstructionSource<'_> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.code.len() {
            return None;
        }
        match self.dis.decode_at(self.code, self.pos, self.base_addr) {
            Ok(insn) => {
                self.pos += insn.size as usize;
                Some(Ok(insn))
            }
            Err(e) => {
                self.pos = self.code.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_intel() {
        // mov eax, 1
        let code = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let dis = Disassembler::new(Syntax::Intel, false).unwrap();
        let insn = dis.decode_at(&code, 0, 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.size, 5);
        assert_eq!(insn.addr, 0x1000);
        assert_eq!(insn.bytes(), &code);
        assert!(insn.detail.is_none());
    }

    #[test]
    fn test_decode_att_syntax() {
        let code = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let dis = Disassembler::new(Syntax::Att, false).unwrap();
        let insn = dis.decode_at(&code, 0, 0).unwrap();
        // ATT decorates the mnemonic with an operand-size suffix.
        assert!(insn.mnemonic.starts_with("mov"));
        assert!(insn.op_str.contains("%eax"));
    }

    #[test]
    fn test_groups() {
        let dis = Disassembler::new(Syntax::Att, true).unwrap();

        let ret = dis.decode_at(&[0xc3], 0, 0).unwrap();
        assert!(ret.is_ret());
        assert!(!ret.is_call());

        // jne +2
        let jne = dis.decode_at(&[0x75, 0x02], 0, 0).unwrap();
        assert!(jne.is_jump());

        // call rel32
        let call = dis.decode_at(&[0xe8, 0x00, 0x00, 0x00, 0x00], 0, 0).unwrap();
        assert!(call.is_call());
    }

    #[test]
    fn test_operand_detail() {
        // add rbx, rax (intel): two register operands
        let code = [0x48, 0x01, 0xc3];
        let dis = Disassembler::new(Syntax::Intel, true).unwrap();
        let insn = dis.decode_at(&code, 0, 0).unwrap();
        let detail = insn.detail.as_ref().unwrap();
        assert_eq!(detail.operands.len(), 2);
        // Destination is read+write, source is read-only.
        assert!(detail.operands.iter().any(|op| op.write));
        assert!(detail.operands.iter().all(|op| op.readable()));
        assert!(detail
            .operands
            .iter()
            .all(|op| matches!(op.kind, OperandKind::Reg(_))));
    }

    #[test]
    fn test_branch_target() {
        let dis = Disassembler::new(Syntax::Att, true).unwrap();
        // jmp rel8 at address 0x100: e9 target = 0x100 + 2 + 0x10
        let jmp = dis.decode_at(&[0xeb, 0x10], 0, 0x100).unwrap();
        assert_eq!(jmp.target(), 0x112);

        let ret = dis.decode_at(&[0xc3], 0, 0x100).unwrap();
        assert_eq!(ret.target(), -1);
    }

    #[test]
    fn test_data_pseudo_instruction() {
        // 0x06 is not a valid 64-bit opcode.
        let dis = Disassembler::new(Syntax::Att, false).unwrap();
        let insn = dis.decode_at(&[0x06], 0, 0).unwrap();
        assert!(insn.is_data());
        assert_eq!(insn.size, 1);
    }

    #[test]
    fn test_linear_iteration() {
        // nop; nop; ret
        let code = [0x90, 0x90, 0xc3];
        let dis = Disassembler::new(Syntax::Att, false).unwrap();
        let insns: Vec<_> = dis
            .iter(&code, 0x400000)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].addr, 0x400000);
        assert_eq!(insns[1].offset, 1);
        assert!(insns[2].mnemonic.starts_with("ret"));
    }
}
