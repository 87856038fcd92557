//! The match/action rule language: typed AST, parser, and evaluator.
//!
//! A rule is an ordered list of match entries (ANDed, left to right) plus
//! one action. Rules are built once from the command line and immutable
//! afterwards.

pub mod eval;
pub mod lexer;
pub mod parser;

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::args::{Argument, ArgumentKind};

/// A sorted, deduplicated set of integers; CSV-loaded values remember the
/// row they came from.
pub type ValueSet = BTreeMap<i64, Option<usize>>;

/// Instruction attribute a match entry tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    True,
    False,
    Address,
    Assembly,
    Call,
    Jump,
    Mnemonic,
    Offset,
    Op,
    Src,
    Dst,
    Imm,
    Reg,
    Mem,
    Plugin,
    Random,
    Return,
    Size,
}

impl MatchKind {
    /// Attribute keyword as written in rules.
    pub fn name(&self) -> &'static str {
        match self {
            MatchKind::True => "true",
            MatchKind::False => "false",
            MatchKind::Address => "addr",
            MatchKind::Assembly => "asm",
            MatchKind::Call => "call",
            MatchKind::Jump => "jump",
            MatchKind::Mnemonic => "mnemonic",
            MatchKind::Offset => "offset",
            MatchKind::Op => "op",
            MatchKind::Src => "src",
            MatchKind::Dst => "dst",
            MatchKind::Imm => "imm",
            MatchKind::Reg => "reg",
            MatchKind::Mem => "mem",
            MatchKind::Plugin => "plugin",
            MatchKind::Random => "random",
            MatchKind::Return => "return",
            MatchKind::Size => "size",
        }
    }

    /// Operand-oriented attributes take `[index]` and a `.field`.
    pub fn is_operand(&self) -> bool {
        matches!(
            self,
            MatchKind::Op
                | MatchKind::Src
                | MatchKind::Dst
                | MatchKind::Imm
                | MatchKind::Reg
                | MatchKind::Mem
        )
    }

    /// String-valued attributes compare against a regex.
    pub fn is_string(&self) -> bool {
        matches!(self, MatchKind::Assembly | MatchKind::Mnemonic)
    }

    /// Attributes that require the disassembler's detail mode.
    pub fn needs_detail(&self) -> bool {
        self.is_operand()
            || matches!(
                self,
                MatchKind::Call | MatchKind::Jump | MatchKind::Return | MatchKind::Plugin
            )
    }
}

/// Projection applied to an operand-oriented attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Field {
    #[default]
    None,
    Size,
    Type,
    Read,
    Write,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::None => "",
            Field::Size => "size",
            Field::Type => "type",
            Field::Read => "read",
            Field::Write => "write",
        }
    }
}

/// Match comparison operator. Entries without an explicit comparison
/// default to `NeqZero`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCmp {
    EqZero,
    NeqZero,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl MatchCmp {
    /// Inversion applied by a leading `!`.
    pub fn invert(self) -> Self {
        match self {
            MatchCmp::Eq => MatchCmp::Neq,
            MatchCmp::Neq => MatchCmp::Eq,
            MatchCmp::Lt => MatchCmp::Geq,
            MatchCmp::Leq => MatchCmp::Gt,
            MatchCmp::Gt => MatchCmp::Leq,
            MatchCmp::Geq => MatchCmp::Lt,
            MatchCmp::NeqZero => MatchCmp::EqZero,
            MatchCmp::EqZero => MatchCmp::NeqZero,
        }
    }
}

impl fmt::Display for MatchCmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchCmp::EqZero => "=0",
            MatchCmp::NeqZero => "!=0",
            MatchCmp::Eq => "=",
            MatchCmp::Neq => "!=",
            MatchCmp::Lt => "<",
            MatchCmp::Leq => "<=",
            MatchCmp::Gt => ">",
            MatchCmp::Geq => ">=",
        };
        write!(f, "{}", s)
    }
}

/// Value payload of a match entry.
#[derive(Debug, Clone)]
pub enum MatchPayload {
    /// `=0` / `!=0` entries carry no values.
    None,
    /// Compiled full-string regex plus the pattern it was built from.
    Regex { pattern: String, re: Regex },
    /// Literal or CSV-loaded integer set.
    Values(ValueSet),
}

impl PartialEq for MatchPayload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MatchPayload::None, MatchPayload::None) => true,
            (
                MatchPayload::Regex { pattern: a, .. },
                MatchPayload::Regex { pattern: b, .. },
            ) => a == b,
            (MatchPayload::Values(a), MatchPayload::Values(b)) => a == b,
            _ => false,
        }
    }
}

/// Binding of a match entry to a CSV column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvBinding {
    pub basename: String,
    pub column: usize,
}

/// Reference to an opened plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRef {
    /// Index into the process-wide plugin table.
    pub id: usize,
    /// The name the rule used to open it.
    pub name: String,
}

/// One parsed match entry.
#[derive(Debug, Clone)]
pub struct MatchEntry {
    /// The original `--match` text, kept for the debug trace.
    pub source: String,
    pub kind: MatchKind,
    pub idx: Option<u8>,
    pub field: Field,
    pub cmp: MatchCmp,
    pub payload: MatchPayload,
    /// Plugin reference for `plugin[NAME]` entries.
    pub plugin: Option<PluginRef>,
    /// CSV binding when the value-set was loaded from a file.
    pub csv: Option<CsvBinding>,
}

impl PartialEq for MatchEntry {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.idx == other.idx
            && self.field == other.field
            && self.cmp == other.cmp
            && self.payload == other.payload
            && self.plugin == other.plugin
            && self.csv == other.csv
    }
}

impl fmt::Display for MatchEntry {
    /// Canonical form; parsing it back yields an equal entry.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cmp == MatchCmp::EqZero {
            write!(f, "!")?;
        }
        write!(f, "{}", self.kind.name())?;
        if let Some(plugin) = &self.plugin {
            write!(f, "[{}]", plugin.name)?;
        }
        if let Some(idx) = self.idx {
            write!(f, "[{}]", idx)?;
        }
        if self.field != Field::None {
            write!(f, ".{}", self.field.name())?;
        }
        match &self.payload {
            MatchPayload::None => {}
            MatchPayload::Regex { pattern, .. } => {
                write!(f, " {} /{}/", self.cmp, pattern)?;
            }
            MatchPayload::Values(set) => {
                if let Some(csv) = &self.csv {
                    write!(f, " {} {}[{}]", self.cmp, csv.basename, csv.column)?;
                } else {
                    let values: Vec<String> = set.keys().map(|v| v.to_string()).collect();
                    write!(f, " {} {}", self.cmp, values.join(","))?;
                }
            }
        }
        Ok(())
    }
}

/// Kind of rewrite requested when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Call,
    Passthru,
    Plugin,
    Print,
    Trap,
}

/// Placement of an instrumentation call relative to the matched
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallKind {
    #[default]
    Before,
    After,
    Replace,
    Conditional,
}

impl CallKind {
    pub fn name(&self) -> &'static str {
        match self {
            CallKind::Before => "before",
            CallKind::After => "after",
            CallKind::Replace => "replace",
            CallKind::Conditional => "conditional",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One parsed action with the match entries that guard it.
#[derive(Debug, Clone)]
pub struct Action {
    /// The original `--action` text.
    pub source: String,
    pub entries: Vec<MatchEntry>,
    pub kind: ActionKind,
    /// Canonical trampoline name; dedup key for call trampolines.
    pub name: String,
    /// Call target path or plugin path.
    pub filename: Option<String>,
    pub symbol: Option<String>,
    pub plugin: Option<usize>,
    pub args: Vec<Argument>,
    pub clean: bool,
    pub call: CallKind,
}

impl PartialEq for Action {
    /// AST equality; the original source text is not compared.
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
            && self.kind == other.kind
            && self.name == other.name
            && self.filename == other.filename
            && self.symbol == other.symbol
            && self.plugin == other.plugin
            && self.args == other.args
            && self.clean == other.clean
            && self.call == other.call
    }
}

impl fmt::Display for Action {
    /// Canonical form; parsing it back yields an equal action.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ActionKind::Passthru => write!(f, "passthru"),
            ActionKind::Print => write!(f, "print"),
            ActionKind::Trap => write!(f, "trap"),
            ActionKind::Plugin => {
                write!(f, "plugin[{}]", self.filename.as_deref().unwrap_or(""))
            }
            ActionKind::Call => {
                write!(
                    f,
                    "call[{},{}]{}(",
                    if self.clean { "clean" } else { "naked" },
                    self.call,
                    self.symbol.as_deref().unwrap_or("")
                )?;
                for (i, arg) in self.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    if arg.ptr {
                        write!(f, "&")?;
                    }
                    match &arg.kind {
                        ArgumentKind::Integer => write!(f, "{}", arg.value)?,
                        ArgumentKind::User => write!(
                            f,
                            "{}[{}]",
                            arg.basename.as_deref().unwrap_or(""),
                            arg.value
                        )?,
                        kind if kind.is_operand() => {
                            write!(f, "{}[{}]", kind.name(), arg.value)?
                        }
                        kind => write!(f, "{}", kind.name())?,
                    }
                }
                write!(f, ")@{}", self.filename.as_deref().unwrap_or(""))
            }
        }
    }
}

/// Whether any rule or argument needs the disassembler's detail mode
/// (operand records and group membership).
pub fn needs_detail(actions: &[Action]) -> bool {
    actions.iter().any(|action| {
        action.kind == ActionKind::Plugin
            || action.entries.iter().any(|e| e.kind.needs_detail())
            || action.args.iter().any(|arg| {
                arg.kind.is_operand()
                    || matches!(arg.kind, ArgumentKind::Next | ArgumentKind::Target)
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_inversion_involutive() {
        for cmp in [
            MatchCmp::EqZero,
            MatchCmp::NeqZero,
            MatchCmp::Eq,
            MatchCmp::Neq,
            MatchCmp::Lt,
            MatchCmp::Leq,
            MatchCmp::Gt,
            MatchCmp::Geq,
        ] {
            assert_eq!(cmp.invert().invert(), cmp);
        }
        assert_eq!(MatchCmp::Lt.invert(), MatchCmp::Geq);
        assert_eq!(MatchCmp::NeqZero.invert(), MatchCmp::EqZero);
    }

    #[test]
    fn test_kind_classes() {
        assert!(MatchKind::Src.is_operand());
        assert!(!MatchKind::Address.is_operand());
        assert!(MatchKind::Mnemonic.is_string());
        assert!(MatchKind::Return.needs_detail());
        assert!(!MatchKind::Offset.needs_detail());
    }
}
