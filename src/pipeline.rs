//! The instruction pipeline: sequential disassembly of the code section,
//! plugin notification/matching, and first-match action selection.
//!
//! One pass normally; two passes when any plugin exports an `instr` hook
//! (pass one notifies, pass two re-decodes the buffered locations and
//! performs the actual selection).

use std::os::raw::c_void;

use rand::Rng;

use crate::backend::Backend;
use crate::disasm::Disassembler;
use crate::elf::Elf;
use crate::plugin::PluginHost;
use crate::rules::{eval, Action};
use crate::{Error, Location, Result};

/// Desync policy: `Some(n)` skips `n` instructions after a desync,
/// `None` makes any desync fatal.
pub type SyncPolicy = Option<u32>;

/// Pass one: walk the whole code section, buffering one [`Location`] per
/// decoded instruction. In two-pass mode plugins are notified and no
/// selection happens; otherwise plugins are matched and the first matching
/// action per instruction is recorded.
pub fn scan<P: PluginHost>(
    elf: &Elf,
    dis: &Disassembler,
    actions: &[Action],
    plugins: &mut P,
    rng: &mut impl Rng,
    sync: SyncPolicy,
    backend: &mut Backend,
) -> Result<Vec<Location>> {
    backend.flush()?;
    let fd = backend.raw_fd();
    let handle = dis as *const Disassembler as *const c_void;
    let two_pass = plugins.two_pass();
    let code = elf.text();

    let mut locs = Vec::new();
    let mut countdown: u64 = 0;
    let mut desynced = false;
    let mut source = dis.iter(code, elf.text_addr);
    for insn in &mut source {
        let insn = insn?;
        if countdown > 0 {
            countdown -= 1;
            continue;
        }
        if insn.is_data() {
            log::warn!(
                "failed to disassemble ({}) at address {:#x}",
                insn.assembly(),
                insn.addr
            );
            desynced = true;
            countdown = match sync {
                Some(n) => n as u64,
                None => u64::MAX,
            };
            continue;
        }

        let offset = insn.offset;
        if two_pass {
            plugins.notify_all(fd, elf, handle, offset as i64, &insn);
            locs.push(Location::new(offset, insn.size, None));
        } else {
            plugins.match_all(fd, elf, handle, offset as i64, &insn);
            let idx = eval::select_action(actions, &insn, offset, plugins, rng);
            locs.push(Location::new(offset, insn.size, idx));
        }
    }

    if source.pos() != code.len() {
        return Err(Error::Disasm(format!(
            "the full (.text) section {:#x}..{:#x}; could only disassemble the \
             range {:#x}..{:#x}",
            elf.text_addr,
            elf.text_addr + elf.text_size,
            elf.text_addr,
            elf.text_addr + source.pos() as u64
        )));
    }
    if desynced {
        if sync.is_none() {
            return Err(Error::Disasm(format!(
                "the (.text) section of \"{}\"; this may be caused by (1) data \
                 in the (.text) section, or (2) a bug in the third party \
                 disassembler",
                elf.path.display()
            )));
        }
        log::warn!(
            "failed to disassemble the (.text) section of \"{}\"; the \
             rewritten binary may be corrupt",
            elf.path.display()
        );
    }
    Ok(locs)
}

/// Pass two (two-pass mode only): rewalk the buffered locations,
/// re-decoding each instruction at its known offset, and update the
/// selections in place.
pub fn rescan<P: PluginHost>(
    elf: &Elf,
    dis: &Disassembler,
    actions: &[Action],
    plugins: &mut P,
    rng: &mut impl Rng,
    locs: &mut [Location],
    backend: &mut Backend,
) -> Result<()> {
    backend.flush()?;
    let fd = backend.raw_fd();
    let handle = dis as *const Disassembler as *const c_void;
    let code = elf.text();

    for loc in locs.iter_mut() {
        let insn = dis.decode_at(code, loc.offset as usize, elf.text_addr)?;
        if insn.is_data() {
            return Err(Error::Disasm(format!(
                "instruction at address {:#x}",
                insn.addr
            )));
        }
        plugins.match_all(fd, elf, handle, loc.offset as i64, &insn);
        if let Some(idx) = eval::select_action(actions, &insn, loc.offset, plugins, rng) {
            *loc = Location::new(loc.offset, insn.size, Some(idx));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testbuf::SharedBuf;
    use crate::csv::CsvCache;
    use crate::disasm::Syntax;
    use crate::plugin::stub::StubHost;
    use crate::plugin::PluginTable;
    use crate::rules::parser::{parse_action, parse_match, ParserCtx};
    use crate::rules::{needs_detail, MatchCmp, MatchEntry, MatchKind, MatchPayload, PluginRef};
    use crate::testelf::tiny_elf;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::io::Write;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(crate::RNG_SEED)
    }

    fn elf_with(text: &[u8]) -> (Elf, tempfile::NamedTempFile) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&tiny_elf(text)).unwrap();
        f.flush().unwrap();
        let elf = Elf::parse(f.path(), 0).unwrap();
        (elf, f)
    }

    fn rules(groups: &[(&[&str], &str)]) -> Vec<Action> {
        let mut plugins = PluginTable::new();
        let mut csvs = CsvCache::new();
        let mut ctx = ParserCtx {
            plugins: &mut plugins,
            csvs: &mut csvs,
        };
        let mut actions = Vec::new();
        for (matches, action) in groups {
            let mut entries = Vec::new();
            for m in *matches {
                parse_match(m, &mut ctx, &mut entries).unwrap();
            }
            actions.push(parse_action(action, entries, &mut ctx).unwrap());
        }
        actions
    }

    fn make_backend() -> (Backend, SharedBuf) {
        let buf = SharedBuf::new();
        (Backend::from_writer(Box::new(buf.clone())), buf)
    }

    #[test]
    fn test_scan_selects_returns() {
        // nop; nop; ret; nop
        let (elf, _f) = elf_with(&[0x90, 0x90, 0xc3, 0x90]);
        let actions = rules(&[(&["return"], "trap")]);
        let dis = Disassembler::new(Syntax::Att, needs_detail(&actions)).unwrap();
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();

        let locs = scan(
            &elf, &dis, &actions, &mut plugins, &mut rng(), None, &mut backend,
        )
        .unwrap();
        assert_eq!(locs.len(), 4);
        assert_eq!(locs[0].action, None);
        assert_eq!(locs[2].offset, 2);
        assert_eq!(locs[2].action, Some(0));
        assert_eq!(locs[3].action, None);
    }

    #[test]
    fn test_scan_operand_count_rule() {
        // add %rax,%rbx (3 bytes); ret
        let (elf, _f) = elf_with(&[0x48, 0x01, 0xc3, 0xc3]);
        let actions = rules(&[(&["op.size>=2"], "print")]);
        let dis = Disassembler::new(Syntax::Att, needs_detail(&actions)).unwrap();
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();

        let locs = scan(
            &elf, &dis, &actions, &mut plugins, &mut rng(), None, &mut backend,
        )
        .unwrap();
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].action, Some(0)); // two operands
        assert_eq!(locs[1].action, None); // ret has none
    }

    #[test]
    fn test_first_match_wins_in_command_line_order() {
        let (elf, _f) = elf_with(&[0xc3]);
        let actions = rules(&[
            (&["call"], "print"),
            (&["return"], "trap"),
            (&["true"], "passthru"),
        ]);
        let dis = Disassembler::new(Syntax::Att, true).unwrap();
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();

        let locs = scan(
            &elf, &dis, &actions, &mut plugins, &mut rng(), None, &mut backend,
        )
        .unwrap();
        assert_eq!(locs[0].action, Some(1));
    }

    #[test]
    fn test_desync_fatal_without_sync() {
        // nop; invalid; nop
        let (elf, _f) = elf_with(&[0x90, 0x06, 0x90]);
        let actions = rules(&[(&["true"], "passthru")]);
        let dis = Disassembler::new(Syntax::Att, false).unwrap();
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();

        let err = scan(
            &elf, &dis, &actions, &mut plugins, &mut rng(), None, &mut backend,
        )
        .unwrap_err();
        assert!(err.to_string().contains("data in the (.text) section"));
    }

    #[test]
    fn test_desync_sync_skips_instructions() {
        // nop; invalid; nop; nop
        let (elf, _f) = elf_with(&[0x90, 0x06, 0x90, 0x90]);
        let actions = rules(&[(&["true"], "passthru")]);
        let dis = Disassembler::new(Syntax::Att, false).unwrap();

        // sync=1 skips the instruction after the desync site.
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();
        let locs = scan(
            &elf, &dis, &actions, &mut plugins, &mut rng(), Some(1), &mut backend,
        )
        .unwrap();
        let offsets: Vec<u64> = locs.iter().map(|l| l.offset).collect();
        assert_eq!(offsets, vec![0, 3]);

        // sync=0 resumes immediately.
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();
        let locs = scan(
            &elf, &dis, &actions, &mut plugins, &mut rng(), Some(0), &mut backend,
        )
        .unwrap();
        let offsets: Vec<u64> = locs.iter().map(|l| l.offset).collect();
        assert_eq!(offsets, vec![0, 2, 3]);
    }

    fn plugin_rule() -> Vec<Action> {
        // plugin[stub] != 0 -> print, built by hand so no shared object is
        // needed; the stub host answers for plugin id 0.
        let entry = MatchEntry {
            source: "plugin[stub]!=0".to_string(),
            kind: MatchKind::Plugin,
            idx: None,
            field: crate::rules::Field::None,
            cmp: MatchCmp::NeqZero,
            payload: MatchPayload::None,
            plugin: Some(PluginRef {
                id: 0,
                name: "stub".to_string(),
            }),
            csv: None,
        };
        let mut actions = rules(&[(&["true"], "print")]);
        actions[0].entries = vec![entry];
        actions
    }

    #[test]
    fn test_plugin_match_equivalent_to_call_attribute() {
        // call rel32; nop; ret
        let text = [0xe8, 0x00, 0x00, 0x00, 0x00, 0x90, 0xc3];
        let (elf, _f) = elf_with(&text);
        let dis = Disassembler::new(Syntax::Att, true).unwrap();

        let plugin_actions = plugin_rule();
        let mut host = StubHost::with_match(false, |insn| insn.is_call() as i64);
        let (mut backend, _) = make_backend();
        let via_plugin = scan(
            &elf, &dis, &plugin_actions, &mut host, &mut rng(), None, &mut backend,
        )
        .unwrap();

        let call_actions = rules(&[(&["call"], "print")]);
        let mut plugins = PluginTable::new();
        let (mut backend, _) = make_backend();
        let via_attr = scan(
            &elf, &dis, &call_actions, &mut plugins, &mut rng(), None, &mut backend,
        )
        .unwrap();

        let a: Vec<Option<u16>> = via_plugin.iter().map(|l| l.action).collect();
        let b: Vec<Option<u16>> = via_attr.iter().map(|l| l.action).collect();
        assert_eq!(a, b);
        assert_eq!(a[0], Some(0));
        assert_eq!(a[1], None);
    }

    #[test]
    fn test_two_pass_defers_selection_to_rescan() {
        let text = [0xe8, 0x00, 0x00, 0x00, 0x00, 0x90, 0xc3];
        let (elf, _f) = elf_with(&text);
        let dis = Disassembler::new(Syntax::Att, true).unwrap();
        let actions = plugin_rule();

        let mut host = StubHost::with_match(true, |insn| insn.is_call() as i64);
        let (mut backend, _) = make_backend();
        let mut locs = scan(
            &elf, &dis, &actions, &mut host, &mut rng(), None, &mut backend,
        )
        .unwrap();

        // Pass one only notified: every instruction seen, nothing matched,
        // nothing selected.
        assert_eq!(host.instr_offsets, vec![0, 5, 6]);
        assert!(host.match_offsets.is_empty());
        assert!(locs.iter().all(|l| l.action.is_none()));

        rescan(
            &elf, &dis, &actions, &mut host, &mut rng(), &mut locs, &mut backend,
        )
        .unwrap();
        assert_eq!(host.match_offsets, vec![0, 5, 6]);
        assert_eq!(locs[0].action, Some(0));
        assert_eq!(locs[1].action, None);
        assert_eq!(locs[2].action, None);
    }

    #[test]
    fn test_one_pass_interleaves_match_calls() {
        let text = [0x90, 0xc3];
        let (elf, _f) = elf_with(&text);
        let dis = Disassembler::new(Syntax::Att, true).unwrap();
        let actions = plugin_rule();

        let mut host = StubHost::with_match(false, |_| 0);
        let (mut backend, _) = make_backend();
        let locs = scan(
            &elf, &dis, &actions, &mut host, &mut rng(), None, &mut backend,
        )
        .unwrap();
        assert!(host.instr_offsets.is_empty());
        assert_eq!(host.match_offsets, vec![0, 1]);
        assert_eq!(locs.len(), 2);
    }
}
