// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! ARM Thumb decoding, narrowed to the shapes the relocator inspects.
//!
//! Everything capstone-specific stays inside this module. The rest of the
//! crate sees a decoded instruction as one of three cases: a direct branch
//! with an absolute target, a PC-relative literal load with the resolved
//! pool address, or something irrelevant.

use capstone::arch::arm::{ArchMode, ArmOperandType};
use capstone::arch::ArchOperand;
use capstone::prelude::*;

use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    B,
    Bl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedInsn {
    /// `b` or `bl` with an immediate target address.
    Branch {
        address: u32,
        kind: BranchKind,
        target: u32,
    },
    /// `ldr Rd, [pc, #imm]`; `literal_addr` is the pool word it reads.
    PcRelLoad { address: u32, literal_addr: u32 },
    Other { address: u32 },
}

/// Decode the image as Thumb starting at `base`. Decoding stops at the
/// first undecodable halfword, so the sequence is bounded by the image
/// length but may end early inside data.
pub fn decode_thumb(image: &[u8], base: u32) -> Result<Vec<DecodedInsn>, PatchError> {
    let cs = Capstone::new()
        .arm()
        .mode(ArchMode::Thumb)
        .detail(true)
        .build()?;
    let insns = cs.disasm_all(image, u64::from(base))?;

    let mut decoded = Vec::with_capacity(insns.len());
    for insn in insns.iter() {
        let address = insn.address() as u32;
        decoded.push(match insn.mnemonic() {
            Some("b") => classify_branch(&cs, insn, address, BranchKind::B)?,
            Some("bl") => classify_branch(&cs, insn, address, BranchKind::Bl)?,
            Some("ldr") => classify_load(&cs, insn, address)?,
            _ => DecodedInsn::Other { address },
        });
    }
    Ok(decoded)
}

fn classify_branch(
    cs: &Capstone,
    insn: &capstone::Insn,
    address: u32,
    kind: BranchKind,
) -> Result<DecodedInsn, PatchError> {
    let detail = cs.insn_detail(insn)?;
    if let Some(ArchOperand::ArmOperand(op)) = detail.arch_detail().operands().first() {
        if let ArmOperandType::Imm(imm) = &op.op_type {
            return Ok(DecodedInsn::Branch {
                address,
                kind,
                target: *imm as u32,
            });
        }
    }
    Ok(DecodedInsn::Other { address })
}

fn classify_load(
    cs: &Capstone,
    insn: &capstone::Insn,
    address: u32,
) -> Result<DecodedInsn, PatchError> {
    let detail = cs.insn_detail(insn)?;
    let operands = detail.arch_detail().operands();
    if let [ArchOperand::ArmOperand(dst), ArchOperand::ArmOperand(src)] = &operands[..] {
        if let (ArmOperandType::Reg(_), ArmOperandType::Mem(mem)) = (&dst.op_type, &src.op_type) {
            if cs.reg_name(mem.base()).as_deref() == Some("pc") {
                // Thumb reads the pool relative to the word-aligned PC.
                let literal_addr = (address.wrapping_add(4) & !3).wrapping_add_signed(mem.disp());
                return Ok(DecodedInsn::PcRelLoad {
                    address,
                    literal_addr,
                });
            }
        }
    }
    Ok(DecodedInsn::Other { address })
}
