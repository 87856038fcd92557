//! Parsers for `--match` and `--action` expressions.
//!
//! A match parses as `['!'] ATTR ('[' idx ']')? ('.' field)? (CMP VALUES)?`;
//! an absent comparison means `!= 0`, and a leading `!` inverts whatever
//! comparison follows. An action parses as a bare kind, `plugin[NAME]`,
//! or the call form `call[OPTS] SYMBOL(ARGS)@BINARY`.
//!
//! Parsing has side effects by design: plugins named by rules are opened
//! immediately and CSV files are loaded and indexed, so every load error
//! surfaces before the pipeline starts.

use regex::Regex;

use super::lexer::{Lexer, Token};
use super::{
    Action, ActionKind, CallKind, CsvBinding, Field, MatchCmp, MatchEntry, MatchKind,
    MatchPayload, PluginRef, ValueSet,
};
use crate::args::{self, Argument, ArgumentKind, MAX_ARGS};
use crate::csv::CsvCache;
use crate::plugin::PluginTable;
use crate::{Error, Result};

/// Shared load state the parsers thread through: the process-wide plugin
/// table and the CSV cache.
pub struct ParserCtx<'a> {
    pub plugins: &'a mut PluginTable,
    pub csvs: &'a mut CsvCache,
}

fn match_kind(name: &str) -> Option<MatchKind> {
    Some(match name {
        "true" => MatchKind::True,
        "false" => MatchKind::False,
        "asm" => MatchKind::Assembly,
        "addr" => MatchKind::Address,
        "call" => MatchKind::Call,
        "dst" => MatchKind::Dst,
        "imm" => MatchKind::Imm,
        "jump" => MatchKind::Jump,
        "mem" => MatchKind::Mem,
        "mnemonic" => MatchKind::Mnemonic,
        "offset" => MatchKind::Offset,
        "op" => MatchKind::Op,
        "plugin" => MatchKind::Plugin,
        "random" => MatchKind::Random,
        "reg" => MatchKind::Reg,
        "return" => MatchKind::Return,
        "size" => MatchKind::Size,
        "src" => MatchKind::Src,
        _ => return None,
    })
}

/// `[ INT ]` with an inclusive range check.
fn parse_index(lexer: &mut Lexer, lb: i64, ub: i64) -> Result<i64> {
    lexer.expect_punct('[')?;
    let idx = lexer.expect_int()?;
    lexer.expect_punct(']')?;
    if idx < lb || idx > ub {
        return Err(lexer.fail(format!(
            "expected index within the range {}..{}, found {}",
            lb, ub, idx
        )));
    }
    Ok(idx)
}

/// A name at a path-ish position: either one quoted string, or raw text up
/// to the stop character.
fn parse_name(lexer: &mut Lexer, stop: char) -> Result<String> {
    if let Token::Str(s) = lexer.peek()? {
        lexer.next()?;
        return Ok(s);
    }
    lexer.take_path(Some(stop))
}

/// Parse one `--match` expression and append its entry to `entries`.
pub fn parse_match(
    src: &str,
    ctx: &mut ParserCtx<'_>,
    entries: &mut Vec<MatchEntry>,
) -> Result<()> {
    let mut lexer = Lexer::new(src, "matching");

    let mut token = lexer.next()?;
    let neg = token == Token::Punct('!');
    if neg {
        token = lexer.next()?;
    }
    let kind = match &token {
        Token::Ident(name) => {
            match_kind(name).ok_or_else(|| lexer.unexpected(&token))?
        }
        _ => return Err(lexer.unexpected(&token)),
    };

    let mut plugin = None;
    let mut idx = None;
    let mut field = Field::None;
    match kind {
        MatchKind::Plugin => {
            lexer.expect_punct('[')?;
            let name = parse_name(&mut lexer, ']')?;
            lexer.expect_punct(']')?;
            let id = ctx.plugins.open(&name)?;
            if !ctx.plugins.get(id).has_match() {
                return Err(lexer.fail(format!(
                    "plugin \"{}\" does not export the \"e9_plugin_match_v1\" function",
                    name
                )));
            }
            plugin = Some(PluginRef { id, name });
        }
        kind if kind.is_operand() => {
            match lexer.peek()? {
                Token::Punct('.') => {}
                Token::Punct('[') => idx = Some(parse_index(&mut lexer, 0, 7)? as u8),
                token => return Err(lexer.unexpected(&token)),
            }
            lexer.expect_punct('.')?;
            let token = lexer.next()?;
            field = match &token {
                Token::Ident(name) => match name.as_str() {
                    "read" => Field::Read,
                    "size" => Field::Size,
                    "type" => Field::Type,
                    "write" => Field::Write,
                    _ => return Err(lexer.unexpected(&token)),
                },
                _ => return Err(lexer.unexpected(&token)),
            };
        }
        _ => {}
    }

    let token = lexer.next()?;
    let mut cmp = match token {
        Token::Punct('=') => MatchCmp::Eq,
        Token::Neq => MatchCmp::Neq,
        Token::Punct('<') => MatchCmp::Lt,
        Token::Leq => MatchCmp::Leq,
        Token::Punct('>') => MatchCmp::Gt,
        Token::Geq => MatchCmp::Geq,
        Token::End => MatchCmp::NeqZero,
        token => return Err(lexer.unexpected(&token)),
    };
    if neg {
        cmp = cmp.invert();
    }

    if kind.is_string() && cmp != MatchCmp::Eq && cmp != MatchCmp::Neq {
        return Err(lexer.fail(format!(
            "invalid match comparison operator `{}' for attribute \"{}\"",
            cmp,
            kind.name()
        )));
    }

    let mut csv = None;
    let payload = if kind.is_string() {
        let token = lexer.next_regex()?;
        let pattern = match token {
            Token::Regex(pattern) => pattern,
            Token::Str(s) | Token::Ident(s) => {
                // A comma list of strings fuses into one alternation.
                let mut pattern = format!("({}", s);
                while lexer.peek()? == Token::Punct(',') {
                    lexer.next()?;
                    match lexer.next()? {
                        Token::Str(s) | Token::Ident(s) => {
                            pattern.push_str(")|(");
                            pattern.push_str(&s);
                        }
                        token => return Err(lexer.unexpected(&token)),
                    }
                }
                pattern.push(')');
                pattern
            }
            token => return Err(lexer.unexpected(&token)),
        };
        lexer.expect_end()?;
        let re = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| lexer.fail(format!("invalid regular expression: {}", e)))?;
        MatchPayload::Regex { pattern, re }
    } else if cmp == MatchCmp::EqZero || cmp == MatchCmp::NeqZero {
        MatchPayload::None
    } else {
        match lexer.peek()? {
            Token::Int(_) => {
                let mut set = ValueSet::new();
                set.insert(lexer.expect_int()?, None);
                while lexer.peek()? == Token::Punct(',') {
                    lexer.next()?;
                    set.insert(lexer.expect_int()?, None);
                }
                lexer.expect_end()?;
                MatchPayload::Values(set)
            }
            _ => {
                let basename = parse_name(&mut lexer, '[')?;
                let column = parse_index(&mut lexer, i64::MIN, i64::MAX)?;
                lexer.expect_end()?;
                let table = ctx.csvs.load(&basename)?;
                if column < 0 || column as usize >= table.width() {
                    return Err(lexer.fail(format!(
                        "CSV file \"{}.csv\" has no column {} ({} columns)",
                        basename,
                        column,
                        table.width()
                    )));
                }
                let column = column as usize;
                let mut set = ValueSet::new();
                for (value, row) in table.int_index(column)? {
                    set.insert(value, Some(row));
                }
                csv = Some(CsvBinding { basename, column });
                MatchPayload::Values(set)
            }
        }
    };

    if cmp == MatchCmp::Neq {
        if let MatchPayload::Values(set) = &payload {
            if set.len() > 1 {
                log::warn!(
                    "matching \"{}\" compares `!=' against multiple values and \
                     will match every instruction",
                    src.trim()
                );
            }
        }
    }

    entries.push(MatchEntry {
        source: src.trim().to_string(),
        kind,
        idx,
        field,
        cmp,
        payload,
        plugin,
        csv,
    });
    Ok(())
}

/// Parse one `--action` expression, consuming the match entries collected
/// since the previous action.
pub fn parse_action(
    src: &str,
    entries: Vec<MatchEntry>,
    ctx: &mut ParserCtx<'_>,
) -> Result<Action> {
    if entries.is_empty() {
        return Err(Error::Parse(
            "action; the `--action' or `-A' option must be preceded by one or \
             more `--match' or `-M' options"
                .to_string(),
        ));
    }

    let mut lexer = Lexer::new(src, "action");
    let token = lexer.next()?;
    let kind = match &token {
        Token::Ident(name) => match name.as_str() {
            "call" => ActionKind::Call,
            "passthru" => ActionKind::Passthru,
            "plugin" => ActionKind::Plugin,
            "print" => ActionKind::Print,
            "trap" => ActionKind::Trap,
            _ => return Err(lexer.unexpected(&token)),
        },
        _ => return Err(lexer.unexpected(&token)),
    };

    let mut clean = false;
    let mut naked = false;
    let mut before = false;
    let mut after = false;
    let mut replace = false;
    let mut conditional = false;
    let mut call = CallKind::Before;
    let mut symbol = None;
    let mut filename = None;
    let mut plugin = None;
    let mut argv: Vec<Argument> = Vec::new();

    match kind {
        ActionKind::Plugin => {
            lexer.expect_punct('[')?;
            let name = parse_name(&mut lexer, ']')?;
            lexer.expect_punct(']')?;
            lexer.expect_end()?;
            plugin = Some(ctx.plugins.open(&name)?);
            filename = Some(name);
        }
        ActionKind::Call => {
            if lexer.peek()? == Token::Punct('[') {
                lexer.next()?;
                loop {
                    let token = lexer.next()?;
                    match &token {
                        Token::Ident(opt) => match opt.as_str() {
                            "after" => after = true,
                            "before" => before = true,
                            "clean" => clean = true,
                            "conditional" => conditional = true,
                            "naked" => naked = true,
                            "replace" => replace = true,
                            _ => return Err(lexer.unexpected(&token)),
                        },
                        _ => return Err(lexer.unexpected(&token)),
                    }
                    match lexer.next()? {
                        Token::Punct(']') => break,
                        Token::Punct(',') => {}
                        token => return Err(lexer.unexpected(&token)),
                    }
                }
            }
            symbol = Some(match lexer.next()? {
                Token::Ident(s) | Token::Str(s) => s,
                token => return Err(lexer.unexpected(&token)),
            });
            if lexer.peek()? == Token::Punct('(') {
                lexer.next()?;
                if lexer.peek()? == Token::Punct(')') {
                    lexer.next()?;
                } else {
                    loop {
                        if argv.len() >= MAX_ARGS {
                            return Err(lexer.fail(format!(
                                "too many arguments; a maximum of {} arguments are supported",
                                MAX_ARGS
                            )));
                        }
                        let arg = parse_arg(&mut lexer, &entries, ctx, &argv)?;
                        argv.push(arg);
                        match lexer.next()? {
                            Token::Punct(')') => break,
                            Token::Punct(',') => {}
                            token => return Err(lexer.unexpected(&token)),
                        }
                    }
                }
            }
            lexer.expect_punct('@')?;
            filename = Some(lexer.take_path(None)?);

            if clean && naked {
                return Err(lexer.fail(
                    "`clean' and `naked' attributes cannot be used together",
                ));
            }
            if [before, after, replace, conditional]
                .iter()
                .filter(|b| **b)
                .count()
                > 1
            {
                return Err(lexer.fail(
                    "only one of the `before', `after', `replace' and \
                     `conditional' attributes can be used together",
                ));
            }
            clean = if clean { true } else { !naked };
            call = if after {
                CallKind::After
            } else if replace {
                CallKind::Replace
            } else if conditional {
                CallKind::Conditional
            } else {
                CallKind::Before
            };
        }
        _ => lexer.expect_end()?,
    }

    let name = match kind {
        ActionKind::Print => "print".to_string(),
        ActionKind::Passthru => "passthru".to_string(),
        ActionKind::Trap => "trap".to_string(),
        ActionKind::Call => format!(
            "call_{}_{}_{}_{}",
            if clean { "clean" } else { "naked" },
            call,
            symbol.as_deref().unwrap_or(""),
            filename.as_deref().unwrap_or("")
        ),
        ActionKind::Plugin => {
            format!("plugin_{}", filename.as_deref().unwrap_or(""))
        }
    };

    Ok(Action {
        source: src.trim().to_string(),
        entries,
        kind,
        name,
        filename,
        symbol,
        plugin,
        args: argv,
        clean,
        call,
    })
}

fn builtin_arg(name: &str) -> Option<ArgumentKind> {
    Some(match name {
        "asm" => ArgumentKind::Asm,
        "addr" => ArgumentKind::Addr,
        "base" => ArgumentKind::Base,
        "dst" => ArgumentKind::Dst,
        "imm" => ArgumentKind::Imm,
        "instr" => ArgumentKind::Bytes,
        "mem" => ArgumentKind::Mem,
        "next" => ArgumentKind::Next,
        "offset" => ArgumentKind::Offset,
        "op" => ArgumentKind::Op,
        "random" => ArgumentKind::Random,
        "reg" => ArgumentKind::Reg,
        "size" => ArgumentKind::BytesSize,
        "src" => ArgumentKind::Src,
        "staticAddr" => ArgumentKind::StaticAddr,
        "target" => ArgumentKind::Target,
        "trampoline" => ArgumentKind::Trampoline,
        _ => return None,
    })
}

fn parse_arg(
    lexer: &mut Lexer,
    entries: &[MatchEntry],
    ctx: &mut ParserCtx<'_>,
    prev: &[Argument],
) -> Result<Argument> {
    let mut token = lexer.next()?;
    let mut ptr = false;
    if token == Token::Punct('&') {
        ptr = true;
        token = lexer.next()?;
    }

    let mut value = 0i64;
    let mut basename = None;
    let kind = match &token {
        Token::Int(i) => {
            value = *i;
            ArgumentKind::Integer
        }
        Token::Ident(name) | Token::Str(name) => {
            if let Some(kind) = builtin_arg(name) {
                if kind == ArgumentKind::Asm && lexer.peek()? == Token::Punct('.') {
                    lexer.next()?;
                    let token = lexer.next()?;
                    match &token {
                        Token::Ident(f) if f == "len" => ArgumentKind::AsmLen,
                        Token::Ident(f) if f == "size" => ArgumentKind::AsmSize,
                        _ => return Err(lexer.unexpected(&token)),
                    }
                } else {
                    kind
                }
            } else if let Some(reg) = args::register(name) {
                ArgumentKind::Register(reg)
            } else if entries
                .iter()
                .any(|e| e.csv.as_ref().map_or(false, |c| c.basename == *name))
            {
                basename = Some(name.clone());
                ArgumentKind::User
            } else {
                return Err(lexer.unexpected(&token));
            }
        }
        _ => return Err(lexer.unexpected(&token)),
    };

    if kind.is_operand() {
        value = parse_index(lexer, 0, 7)?;
    } else if kind == ArgumentKind::User {
        value = parse_index(lexer, i64::MIN, i64::MAX)?;
        let name = basename.as_deref().unwrap_or("");
        let table = ctx.csvs.get(name).ok_or_else(|| {
            lexer.fail(format!("CSV file \"{}.csv\" is not loaded", name))
        })?;
        if value < 0 || value as usize >= table.width() {
            return Err(lexer.fail(format!(
                "CSV file \"{}.csv\" has no column {} ({} columns)",
                name,
                value,
                table.width()
            )));
        }
    }

    if ptr && !kind.pointer_allowed() {
        return Err(lexer.fail(format!(
            "cannot pass argument `{}' by pointer",
            kind.name()
        )));
    }

    let duplicate = prev.iter().any(|a| a.kind == kind);
    Ok(Argument {
        kind,
        ptr,
        duplicate,
        value,
        basename,
    })
}
