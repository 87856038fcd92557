//! Patch-site metadata: call arguments resolved against one instruction.
//!
//! Driver-computable values (addresses, offsets, assembly strings, branch
//! targets, CSV lookups, random draws) are materialized here; machine-state
//! arguments (register contents, operand values passed by pointer at run
//! time, the trampoline address, the PIC base) stay symbolic descriptors
//! for the backend to fill in.

use rand::Rng;
use serde_json::{json, Value};

use crate::args::{Argument, ArgumentKind};
use crate::csv::{parse_integer, CsvCache};
use crate::disasm::{Instruction, Operand, OperandKind};
use crate::plugin::PluginHost;
use crate::rules::{eval, Action, ActionKind, MatchKind, MatchPayload};
use crate::{Error, Result};

/// Build the metadata for one patch message. Only call actions carry
/// metadata; everything else patches with `None`.
pub fn build_metadata<P: PluginHost>(
    action: &Action,
    insn: &Instruction,
    sec_offset: u64,
    file_offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
    csvs: &CsvCache,
) -> Result<Option<Value>> {
    if action.kind != ActionKind::Call {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(action.args.len());
    for arg in &action.args {
        out.push(resolve_arg(
            action,
            arg,
            insn,
            sec_offset,
            file_offset,
            plugins,
            rng,
            csvs,
        )?);
    }
    Ok(Some(json!({ "args": out })))
}

#[allow(clippy::too_many_arguments)]
fn resolve_arg<P: PluginHost>(
    action: &Action,
    arg: &Argument,
    insn: &Instruction,
    sec_offset: u64,
    file_offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
    csvs: &CsvCache,
) -> Result<Value> {
    let mut descriptor = json!({
        "kind": arg.kind.name(),
        "ptr": arg.ptr,
        "dup": arg.duplicate,
    });
    let value: Value = match &arg.kind {
        ArgumentKind::Asm => Value::String(insn.assembly()),
        ArgumentKind::AsmSize => json!(insn.assembly().len() + 1),
        ArgumentKind::AsmLen => json!(insn.assembly().len()),
        ArgumentKind::Addr | ArgumentKind::StaticAddr => json!(insn.addr),
        ArgumentKind::Bytes => Value::String(hex_bytes(insn.bytes())),
        ArgumentKind::BytesSize => json!(insn.size),
        ArgumentKind::Offset => json!(file_offset),
        ArgumentKind::Next => json!(insn.addr + insn.size as u64),
        ArgumentKind::Target => json!(insn.target()),
        ArgumentKind::Random => json!(rng.gen_range(0..=i32::MAX)),
        ArgumentKind::Integer => json!(arg.value),
        // Run-time values; the backend materializes these.
        ArgumentKind::Base | ArgumentKind::Trampoline | ArgumentKind::Register(_) => {
            Value::Null
        }
        kind if kind.is_operand() => operand_descriptor(kind, arg.value as u8, insn),
        ArgumentKind::User => {
            csv_lookup(action, arg, insn, sec_offset, plugins, rng, csvs)?
        }
        // All kinds are covered above; `is_operand` hides that from the
        // exhaustiveness check.
        _ => Value::Null,
    };
    if !value.is_null() {
        descriptor["value"] = value;
    }
    Ok(descriptor)
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn operand_kind_filter(kind: &ArgumentKind) -> MatchKind {
    match kind {
        ArgumentKind::Src => MatchKind::Src,
        ArgumentKind::Dst => MatchKind::Dst,
        ArgumentKind::Imm => MatchKind::Imm,
        ArgumentKind::Reg => MatchKind::Reg,
        ArgumentKind::Mem => MatchKind::Mem,
        _ => MatchKind::Op,
    }
}

/// Concrete descriptor for a projected operand, or null when the
/// instruction has no such operand.
fn operand_descriptor(kind: &ArgumentKind, idx: u8, insn: &Instruction) -> Value {
    let Some(op) = eval::project_operand(insn, operand_kind_filter(kind), idx) else {
        return Value::Null;
    };
    operand_value(op)
}

fn operand_value(op: &Operand) -> Value {
    match &op.kind {
        OperandKind::Imm(imm) => json!({ "type": "imm", "size": op.size, "imm": imm }),
        OperandKind::Reg(reg) => json!({ "type": "reg", "size": op.size, "reg": reg }),
        OperandKind::Mem(mem) => json!({
            "type": "mem",
            "size": op.size,
            "segment": mem.segment,
            "base": mem.base,
            "index": mem.index,
            "scale": mem.scale,
            "disp": mem.disp,
        }),
    }
}

/// Resolve a `basename[column]` argument through the match entry that
/// bound the CSV: re-evaluate the entry's attribute on this instruction
/// and fetch the named column of the first row holding that value.
/// Row uniqueness is not enforced.
fn csv_lookup<P: PluginHost>(
    action: &Action,
    arg: &Argument,
    insn: &Instruction,
    sec_offset: u64,
    plugins: &P,
    rng: &mut impl Rng,
    csvs: &CsvCache,
) -> Result<Value> {
    let basename = arg.basename.as_deref().unwrap_or("");
    let entry = action
        .entries
        .iter()
        .find(|e| e.csv.as_ref().map_or(false, |c| c.basename == basename))
        .ok_or_else(|| {
            Error::Semantic(format!(
                "CSV file \"{}.csv\" is not bound by any matching",
                basename
            ))
        })?;
    let x = eval::match_value(entry, insn, sec_offset, plugins, rng).ok_or_else(|| {
        Error::Semantic(format!(
            "CSV lookup into \"{}.csv\" is undefined at address {:#x}",
            basename, insn.addr
        ))
    })?;
    let MatchPayload::Values(set) = &entry.payload else {
        return Err(Error::Semantic(format!(
            "CSV file \"{}.csv\" is not bound by any matching",
            basename
        )));
    };
    let row = set.get(&x).copied().flatten().ok_or_else(|| {
        Error::Semantic(format!(
            "CSV file \"{}.csv\" has no row with value {} (address {:#x})",
            basename, x, insn.addr
        ))
    })?;
    let table = csvs.get(basename).ok_or_else(|| {
        Error::Semantic(format!("CSV file \"{}.csv\" is not loaded", basename))
    })?;
    let field = table.field(row, arg.value as usize).ok_or_else(|| {
        Error::Semantic(format!(
            "CSV file \"{}.csv\" row {} has no column {}",
            basename, row, arg.value
        ))
    })?;
    Ok(match parse_integer(field) {
        Some(i) => json!(i),
        None => Value::String(field.to_string()),
    })
}
