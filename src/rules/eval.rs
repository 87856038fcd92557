//! Rule evaluation over one disassembled instruction.
//!
//! Entries evaluate left to right with short-circuit AND. Operand-bearing
//! attributes resolve through the operand projection below; a missing
//! operand makes the entry undefined, which fails it regardless of the
//! comparison.

use rand::Rng;

use super::{Action, Field, MatchCmp, MatchEntry, MatchKind, MatchPayload};
use crate::disasm::{Instruction, Operand, OperandKind};
use crate::plugin::PluginHost;

/// Index of the first action whose rule matches, if any. Actions are
/// tried in command-line order, so the recorded index is always the
/// smallest matching one.
pub fn select_action<P: PluginHost>(
    actions: &[Action],
    insn: &Instruction,
    offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
) -> Option<u16> {
    actions
        .iter()
        .position(|action| match_action(action, insn, offset, plugins, rng))
        .map(|idx| idx as u16)
}

/// Evaluate one rule against one instruction.
pub fn match_action<P: PluginHost>(
    action: &Action,
    insn: &Instruction,
    offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
) -> bool {
    let debug = log::log_enabled!(log::Level::Debug);
    let mut trace = if debug {
        format!("{:#x} [{}]:", insn.addr, insn.assembly())
    } else {
        String::new()
    };

    let mut pass = false;
    for entry in &action.entries {
        pass = match_entry(entry, insn, offset, plugins, rng);
        if debug {
            trace.push_str(&format!(" [{}]", entry.source));
            trace.push_str(if pass { "+" } else { "-" });
        }
        if !pass {
            break;
        }
    }
    if debug {
        if pass {
            trace.push_str(&format!(" action {}", action.source));
        }
        log::debug!("{}", trace);
    }
    pass
}

fn match_entry<P: PluginHost>(
    entry: &MatchEntry,
    insn: &Instruction,
    offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
) -> bool {
    if entry.kind.is_string() {
        let subject = match entry.kind {
            MatchKind::Mnemonic => insn.mnemonic.clone(),
            _ => insn.assembly(),
        };
        let MatchPayload::Regex { re, .. } = &entry.payload else {
            return false;
        };
        let pass = re.is_match(&subject);
        return if entry.cmp == MatchCmp::Neq { !pass } else { pass };
    }

    // Non-zero comparisons against an empty value-set are vacuously false.
    let set = match &entry.payload {
        MatchPayload::Values(set) => {
            if set.is_empty() {
                return false;
            }
            Some(set)
        }
        MatchPayload::None => None,
        MatchPayload::Regex { .. } => return false,
    };

    let Some(x) = match_value(entry, insn, offset, plugins, rng) else {
        return false;
    };
    match entry.cmp {
        MatchCmp::EqZero => x == 0,
        MatchCmp::NeqZero => x != 0,
        MatchCmp::Eq => set.map_or(false, |s| s.contains_key(&x)),
        // A multi-valued `!=` always passes; with one value it means
        // "absent from the set".
        MatchCmp::Neq => set.map_or(false, |s| s.len() != 1 || !s.contains_key(&x)),
        MatchCmp::Lt => set.map_or(false, |s| x < *s.keys().next_back().unwrap()),
        MatchCmp::Leq => set.map_or(false, |s| x <= *s.keys().next_back().unwrap()),
        MatchCmp::Gt => set.map_or(false, |s| x > *s.keys().next().unwrap()),
        MatchCmp::Geq => set.map_or(false, |s| x >= *s.keys().next().unwrap()),
    }
}

/// Dynamic value of a match entry, or `None` when undefined.
pub(crate) fn match_value<P: PluginHost>(
    entry: &MatchEntry,
    insn: &Instruction,
    offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
) -> Option<i64> {
    match entry.kind {
        MatchKind::True => Some(1),
        MatchKind::False => Some(0),
        MatchKind::Address => Some(insn.addr as i64),
        MatchKind::Call => Some(insn.is_call() as i64),
        MatchKind::Jump => Some(insn.is_jump() as i64),
        MatchKind::Return => Some(insn.is_ret() as i64),
        MatchKind::Offset => Some(offset as i64),
        MatchKind::Plugin => Some(plugins.result(entry.plugin.as_ref()?.id)),
        MatchKind::Random => Some(rng.gen_range(0..=i32::MAX) as i64),
        MatchKind::Size => Some(insn.size as i64),
        MatchKind::Assembly | MatchKind::Mnemonic => None,
        kind => operand_value(kind, entry.idx, entry.field, insn),
    }
}

/// Operand projection: map `(kind, index, field)` onto the instruction's
/// operand records.
pub fn operand_value(
    kind: MatchKind,
    idx: Option<u8>,
    field: Field,
    insn: &Instruction,
) -> Option<i64> {
    match idx {
        // No index: only the count-of-matching-operands form is defined.
        None => match field {
            Field::Size => {
                let detail = insn.detail.as_ref()?;
                Some(
                    detail
                        .operands
                        .iter()
                        .filter(|op| operand_passes(op, kind))
                        .count() as i64,
                )
            }
            _ => None,
        },
        Some(idx) => {
            let op = project_operand(insn, kind, idx)?;
            match field {
                Field::Size => Some(op.size as i64),
                Field::Type => Some(op.type_code()),
                Field::Read => Some(op.readable() as i64),
                Field::Write => Some(op.write as i64),
                Field::None => None,
            }
        }
    }
}

/// The `idx`-th operand passing the kind's filter, if it exists.
pub fn project_operand(insn: &Instruction, kind: MatchKind, idx: u8) -> Option<&Operand> {
    let detail = insn.detail.as_ref()?;
    detail
        .operands
        .iter()
        .filter(|op| operand_passes(op, kind))
        .nth(idx as usize)
}

fn operand_passes(op: &Operand, kind: MatchKind) -> bool {
    let type_ok = match kind {
        MatchKind::Imm => matches!(op.kind, OperandKind::Imm(_)),
        MatchKind::Reg => matches!(op.kind, OperandKind::Reg(_)),
        MatchKind::Mem => matches!(op.kind, OperandKind::Mem(_)),
        _ => true,
    };
    if !type_ok {
        return false;
    }
    let (need_read, need_write) = match kind {
        MatchKind::Src => (true, false),
        MatchKind::Dst => (false, true),
        _ => (true, true),
    };
    (need_read && op.readable()) || (need_write && op.write)
}
