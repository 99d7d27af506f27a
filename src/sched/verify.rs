//! A verifier for scheduled blocks.
//!
//! Walking a block bottom-up, every register remembers its closest later reader. A write of
//! the register is legal only if that reader consumes exactly this write, and a read is legal
//! only if every later reader of the same register reads the same value. Nothing but nops
//! may follow the instruction that leaves the block.

use crate::entity::SecondaryMap;
use crate::entity::packed_option::PackedOption;
use crate::ir::{Block, Function, Inst, InstKind, OptoReg, RegAssignment};
use crate::result::{OutputError, OutputResult};

fn has_edge(func: &Function, user: Inst, def: Inst) -> bool {
    let data = &func.insts[user];
    data.inputs.contains(&def) || data.prec.contains(&def)
}

/// Check that no instruction of `block` reads a register another write has clobbered, and
/// that the block ends with its control flow.
pub fn verify_schedule(func: &Function, regs: &RegAssignment, block: Block) -> OutputResult<()> {
    let insts = &func.blocks[block].insts;
    if let Some(end) = insts.iter().position(|&i| func.insts[i].is_block_end()) {
        let is_nop = |i: Inst| matches!(func.insts[i].kind, InstKind::Nop);
        if let Some(&inst) = insts[end + 1..].iter().find(|&&i| !is_nop(i)) {
            log::debug!("{inst} follows {} at the end of {block}", insts[end]);
            return Err(OutputError::BadSchedule { block, inst });
        }
    }

    let mut reader: SecondaryMap<OptoReg, PackedOption<Inst>> = SecondaryMap::new();

    for &inst in insts.iter().rev() {
        let data = &func.insts[inst];
        let kills = data.kill_mask().into_iter().flat_map(|m| m.iter());
        for reg in regs.get(inst).regs().chain(kills) {
            if let Some(user) = reader[reg].take() {
                if !has_edge(func, user, inst) {
                    log::debug!("{user} reads {reg} across {inst}");
                    return Err(OutputError::BadSchedule { block, inst });
                }
            }
        }

        for &def in &data.inputs {
            for reg in regs.get(def).regs() {
                if let Some(user) = reader[reg].expand() {
                    if !has_edge(func, user, def) {
                        log::debug!("{user} and {inst} read different values of {reg}");
                        return Err(OutputError::BadSchedule { block, inst });
                    }
                }
                reader[reg] = inst.into();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::toy::{self, gpr, opcodes::*};

    #[test]
    fn accepts_program_order() {
        let mut fb = toy::builder(None);
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(1)));
        fb.ins(b, STORE, &[x], None);
        let y = fb.ins(b, LOAD, &[], Some(gpr(1)));
        fb.ins(b, ADD, &[y, y], Some(gpr(2)));
        let (func, regs) = fb.finish();
        assert_eq!(verify_schedule(&func, &regs, b), Ok(()));
    }

    #[test]
    fn rejects_clobbered_read() {
        let mut fb = toy::builder(None);
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let z = fb.ins(b, STORE, &[x], None);
        let y = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let w = fb.ins(b, STORE, &[y], None);
        let (mut func, regs) = fb.finish();

        // Hoist the second write above the first read.
        func.blocks[b].insts = [x, y, z, w].into_iter().collect();
        assert_eq!(
            verify_schedule(&func, &regs, b),
            Err(OutputError::BadSchedule { block: b, inst: z })
        );
    }

    #[test]
    fn nothing_runs_after_the_jump() {
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let x = fb.ins(b0, LOAD, &[], Some(gpr(1)));
        let st = fb.ins(b0, STORE, &[x], None);
        let jmp = fb.ins_kind(b0, JMP, InstKind::Branch { conditional: false }, &[], None);
        let nop = fb.ins_kind(b0, NOP, InstKind::Nop, &[], None);
        fb.succs(b0, &[b1]);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();
        assert_eq!(verify_schedule(&func, &regs, b0), Ok(()));

        func.blocks[b0].insts = [x, jmp, st, nop].into_iter().collect();
        assert_eq!(
            verify_schedule(&func, &regs, b0),
            Err(OutputError::BadSchedule { block: b0, inst: st })
        );
    }

    #[test]
    fn kills_count_as_writes() {
        let mut fb = toy::builder(None);
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(3)));
        let poll = fb.ins(b, POLL, &[], None);
        let z = fb.ins(b, STORE, &[x], None);
        fb.kills(poll, &[gpr(3)]);
        let (mut func, regs) = fb.finish();
        assert!(verify_schedule(&func, &regs, b).is_err());

        func.blocks[b].insts = [x, z, poll].into_iter().collect();
        assert_eq!(verify_schedule(&func, &regs, b), Ok(()));
    }
}
