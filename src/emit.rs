//! The emission planner: the ordered protocol of directives sent to the
//! patch backend.
//!
//! Fixed order: `binary`, plugin `init`, secondary `elf-file`s, call
//! trampolines, the builtin trampolines, then instruction/patch messages
//! in reverse offset order, plugin `fini`, and the final `emit`.
//! Reverse-order emission keeps earlier offsets stable as the backend
//! processes displacements.

use std::collections::{HashMap, HashSet};
use std::os::raw::c_void;

use rand::Rng;

use crate::backend::Backend;
use crate::csv::CsvCache;
use crate::disasm::Disassembler;
use crate::elf::{align_up, Elf};
use crate::metadata::build_metadata;
use crate::plugin::PluginHost;
use crate::rules::{Action, ActionKind};
use crate::{Error, Location, Result, PAGE_SIZE};

/// Short-jump reachability bound: the 8-bit displacement range plus the
/// short jump itself (2 bytes) plus one maximum-length instruction (15).
pub const SHORT_JMP_REACH: i64 = i8::MAX as i64 + 2 + 15;

/// Reachability of a location from a patch address. The backend needs the
/// original bytes of displaced neighbours, which only matters within
/// short-jump reach of the patched site.
pub fn in_reach(text_addr: u64, loc_offset: u64, patch_addr: u64) -> bool {
    ((text_addr + loc_offset) as i64 - patch_addr as i64).abs() <= SHORT_JMP_REACH
}

/// Planner state: secondary-ELF layout watermark and trampoline dedup.
pub struct Planner {
    pub have_print: bool,
    pub have_passthru: bool,
    pub have_trap: bool,
    /// File-address watermark for secondary-ELF placement.
    file_addr: u64,
    /// Loaded call-target ELFs, keyed by path.
    files: HashMap<String, Elf>,
    /// Call-trampoline names already defined.
    defined: HashSet<String>,
}

impl Planner {
    /// Secondary ELFs are laid out above the primary's free region.
    pub fn new(primary: &Elf) -> Self {
        Planner {
            have_print: false,
            have_passthru: false,
            have_trap: false,
            file_addr: primary.base + primary.free_addr + 0x100_0000,
            files: HashMap::new(),
            defined: HashSet::new(),
        }
    }

    /// The target ELF loaded for a call action, if any.
    pub fn target(&self, action: &Action) -> Option<&Elf> {
        self.files.get(action.filename.as_deref()?)
    }

    /// Step through the actions once: load each distinct call-target ELF
    /// at its assigned base (8 pages above the watermark, page aligned),
    /// define each distinct call trampoline, then the builtin trampolines.
    pub fn prepare(&mut self, backend: &mut Backend, actions: &[Action]) -> Result<()> {
        for action in actions {
            match action.kind {
                ActionKind::Print => self.have_print = true,
                ActionKind::Passthru => self.have_passthru = true,
                ActionKind::Trap => self.have_trap = true,
                ActionKind::Plugin => {}
                ActionKind::Call => {
                    let filename = action.filename.as_deref().unwrap_or("");
                    if !self.files.contains_key(filename) {
                        let base = align_up(self.file_addr + 8 * PAGE_SIZE, PAGE_SIZE);
                        let target = Elf::parse(filename, base)?;
                        backend.send_elf_file(&target)?;
                        self.file_addr = base + target.free_addr;
                        self.files.insert(filename.to_string(), target);
                    }
                    if self.defined.insert(action.name.clone()) {
                        backend.send_call_trampoline(
                            &action.name,
                            &action.args,
                            action.clean,
                            action.call,
                        )?;
                    }
                }
            }
        }
        if self.have_passthru {
            backend.send_passthru_trampoline()?;
        }
        if self.have_print {
            backend.send_print_trampoline()?;
        }
        if self.have_trap {
            backend.send_trap_trampoline()?;
        }
        Ok(())
    }

    /// Traverse the location buffer in reverse offset order. For each
    /// to-patch location, send instruction messages for every neighbour
    /// within short-jump reach (each at most once), then the patch message
    /// itself (or delegate to the plugin's `patch` hook).
    #[allow(clippy::too_many_arguments)]
    pub fn emit_patches<P: PluginHost>(
        &mut self,
        backend: &mut Backend,
        elf: &Elf,
        dis: &Disassembler,
        actions: &[Action],
        locs: &mut [Location],
        plugins: &mut P,
        rng: &mut impl Rng,
        csvs: &CsvCache,
    ) -> Result<()> {
        let code = elf.text();
        let handle = dis as *const Disassembler as *const c_void;

        for i in (0..locs.len()).rev() {
            let Some(action_idx) = locs[i].action else {
                continue;
            };
            let sec_offset = locs[i].offset;
            let addr = elf.text_addr + sec_offset;
            let file_offset = elf.text_offset + sec_offset;

            let insn = dis.decode_at(code, sec_offset as usize, elf.text_addr)?;
            if insn.is_data() {
                return Err(Error::Disasm(format!(
                    "instruction at address {:#x}",
                    addr
                )));
            }

            // Neighbouring instruction messages, both directions, stopping
            // at the first location out of short-jump reach.
            for j in (0..=i).rev() {
                if !send_instruction(backend, &mut locs[j], addr, elf)? {
                    break;
                }
            }
            for j in i + 1..locs.len() {
                if !send_instruction(backend, &mut locs[j], addr, elf)? {
                    break;
                }
            }

            let action = &actions[action_idx as usize];
            if action.kind == ActionKind::Plugin {
                if let Some(id) = action.plugin {
                    backend.flush()?;
                    plugins.patch(
                        id,
                        backend.raw_fd(),
                        elf,
                        handle,
                        file_offset as i64,
                        &insn,
                    );
                }
            } else {
                let metadata = build_metadata(
                    action,
                    &insn,
                    sec_offset,
                    file_offset,
                    plugins,
                    rng,
                    csvs,
                )?;
                backend.send_patch(&action.name, file_offset, metadata)?;
            }
        }
        Ok(())
    }
}

/// Send one instruction message if the location is still within reach of
/// the patch address; returns false once out of reach (that location is
/// not sent). The emitted flag keeps each message to at most one send.
fn send_instruction(
    backend: &mut Backend,
    loc: &mut Location,
    patch_addr: u64,
    elf: &Elf,
) -> Result<bool> {
    if !in_reach(elf.text_addr, loc.offset, patch_addr) {
        return Ok(false);
    }
    if loc.emitted {
        return Ok(true);
    }
    loc.emitted = true;
    backend.send_instruction(
        elf.text_addr + loc.offset,
        loc.size,
        elf.text_offset + loc.offset,
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testbuf::SharedBuf;
    use crate::disasm::Syntax;
    use crate::pipeline;
    use crate::plugin::PluginTable;
    use crate::rules::needs_detail;
    use crate::rules::parser::{parse_action, parse_match, ParserCtx};
    use crate::testelf::{tiny_elf, TEXT_OFFSET, TEXT_VADDR};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use serde_json::Value;
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

    /// Full driver run over a synthetic ELF with the given rule groups;
    /// returns the decoded directive stream.
    fn drive(text: &[u8], groups: &[(&[&str], &str)]) -> Vec<(String, Value)> {
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

        let (elf, _f) = elf_with(text);
        let dis = Disassembler::new(Syntax::Att, needs_detail(&actions)).unwrap();
        let buf = SharedBuf::new();
        let mut backend = Backend::from_writer(Box::new(buf.clone()));
        let mut rng = rng();

        backend
            .send_binary("exe", &elf.path.display().to_string())
            .unwrap();
        let mut planner = Planner::new(&elf);
        planner.prepare(&mut backend, &actions).unwrap();
        let mut locs = pipeline::scan(
            &elf, &dis, &actions, &mut plugins, &mut rng, None, &mut backend,
        )
        .unwrap();
        planner
            .emit_patches(
                &mut backend,
                &elf,
                &dis,
                &actions,
                &mut locs,
                &mut plugins,
                &mut rng,
                &csvs,
            )
            .unwrap();
        backend.send_emit("a.out", "binary", 4096).unwrap();
        backend.wait().unwrap();
        buf.messages()
    }

    #[test]
    fn test_trap_all_returns_stream() {
        // A single ret: the stream is binary, trap-trampoline,
        // instruction, patch, emit.
        let messages = drive(&[0xc3], &[(&["return"], "trap")]);
        let methods: Vec<&str> = messages.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(
            methods,
            vec!["binary", "trap-trampoline", "instruction", "patch", "emit"]
        );
        assert_eq!(messages[2].1["address"], TEXT_VADDR);
        assert_eq!(messages[2].1["size"], 1);
        assert_eq!(messages[2].1["offset"], TEXT_OFFSET);
        assert_eq!(messages[3].1["trampoline"], "trap");
        assert_eq!(messages[3].1["offset"], TEXT_OFFSET);
        assert_eq!(messages[3].1["metadata"], Value::Null);
    }

    #[test]
    fn test_no_match_no_patch() {
        let messages = drive(&[0x90, 0x90], &[(&["return"], "trap")]);
        assert!(!messages.iter().any(|(m, _)| m == "patch"));
        assert!(!messages.iter().any(|(m, _)| m == "instruction"));
    }

    #[test]
    fn test_print_trampoline_only_when_used() {
        let messages = drive(&[0xc3], &[(&["return"], "print")]);
        assert!(messages.iter().any(|(m, _)| m == "print-trampoline"));
        assert!(!messages.iter().any(|(m, _)| m == "trap-trampoline"));
        assert!(!messages.iter().any(|(m, _)| m == "passthru-trampoline"));
    }

    #[test]
    fn test_reverse_offset_emission_order() {
        // Patch every nop; patch offsets must be strictly decreasing.
        let text = vec![0x90u8; 8];
        let messages = drive(&text, &[(&["mnemonic=nop"], "passthru")]);
        let patch_offsets: Vec<u64> = messages
            .iter()
            .filter(|(m, _)| m == "patch")
            .map(|(_, p)| p["offset"].as_u64().unwrap())
            .collect();
        assert_eq!(patch_offsets.len(), 8);
        assert!(patch_offsets.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_instruction_sent_once_and_before_patch() {
        let text = vec![0x90u8; 8];
        let messages = drive(&text, &[(&["mnemonic=nop"], "passthru")]);

        // Every instruction message appears exactly once.
        let mut seen = std::collections::HashSet::new();
        for (method, params) in &messages {
            if method == "instruction" {
                assert!(seen.insert(params["address"].as_u64().unwrap()));
            }
        }
        assert_eq!(seen.len(), 8);

        // Each patch is preceded by the instruction message for its site.
        for (i, (method, params)) in messages.iter().enumerate() {
            if method == "patch" {
                let offset = params["offset"].as_u64().unwrap();
                let addr = TEXT_VADDR + (offset - TEXT_OFFSET);
                assert!(messages[..i].iter().any(|(m, p)| {
                    m == "instruction" && p["address"].as_u64() == Some(addr)
                }));
            }
        }
    }

    #[test]
    fn test_short_jump_window_boundary() {
        // One ret at the end of a long nop sled. Neighbours within
        // SHORT_JMP_REACH bytes of the patch get instruction messages;
        // the first one beyond does not.
        let reach = SHORT_JMP_REACH as usize;
        let mut text = vec![0x90u8; reach + 40];
        let patch_off = reach + 39;
        text[patch_off] = 0xc3;
        let messages = drive(&text, &[(&["return"], "trap")]);

        let sent: std::collections::HashSet<u64> = messages
            .iter()
            .filter(|(m, _)| m == "instruction")
            .map(|(_, p)| p["offset"].as_u64().unwrap() - TEXT_OFFSET)
            .collect();
        let patch_off = patch_off as u64;
        assert!(sent.contains(&patch_off));
        // Exactly at the reach bound: still sent.
        assert!(sent.contains(&(patch_off - SHORT_JMP_REACH as u64)));
        // One past the bound: not sent.
        assert!(!sent.contains(&(patch_off - SHORT_JMP_REACH as u64 - 1)));
        assert_eq!(sent.len(), reach + 1);
    }

    #[test]
    fn test_call_action_loads_target_and_defines_trampoline_once() {
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("probe.bin");
        std::fs::write(&probe, tiny_elf(&[0xc3])).unwrap();
        let probe = probe.display().to_string();

        // Two rule groups sharing one call target and symbol: the ELF is
        // loaded once and the trampoline defined once.
        let call = format!("call[clean,before]probe(addr)@{}", probe);
        let messages = drive(
            &[0x90, 0xc3],
            &[(&["return"], call.as_str()), (&["mnemonic=nop"], call.as_str())],
        );

        let elf_files: Vec<_> =
            messages.iter().filter(|(m, _)| m == "elf-file").collect();
        assert_eq!(elf_files.len(), 1);
        let base = elf_files[0].1["base"].as_u64().unwrap();
        assert_eq!(base % crate::PAGE_SIZE, 0);
        // 8-page gap above the primary's free region plus the watermark
        // offset.
        assert!(base >= 0x100_0000 + 8 * crate::PAGE_SIZE);

        let trampolines: Vec<_> = messages
            .iter()
            .filter(|(m, _)| m == "call-trampoline")
            .collect();
        assert_eq!(trampolines.len(), 1);
        assert_eq!(
            trampolines[0].1["name"],
            format!("call_clean_before_probe_{}", probe)
        );
        assert_eq!(trampolines[0].1["position"], "before");
        assert_eq!(trampolines[0].1["args"][0]["kind"], "addr");

        // Both instructions patched, with resolved metadata.
        let patches: Vec<_> = messages.iter().filter(|(m, _)| m == "patch").collect();
        assert_eq!(patches.len(), 2);
        assert_eq!(
            patches[0].1["metadata"]["args"][0]["value"],
            TEXT_VADDR + 1
        );
        assert_eq!(patches[1].1["metadata"]["args"][0]["value"], TEXT_VADDR);
    }

    #[test]
    fn test_distinct_call_targets_advance_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, tiny_elf(&[0xc3])).unwrap();
        std::fs::write(&b, tiny_elf(&[0xc3])).unwrap();

        let call_a = format!("call f()@{}", a.display());
        let call_b = format!("call g()@{}", b.display());
        let messages = drive(
            &[0x90, 0xc3],
            &[
                (&["mnemonic=nop"], call_a.as_str()),
                (&["return"], call_b.as_str()),
            ],
        );

        let bases: Vec<u64> = messages
            .iter()
            .filter(|(m, _)| m == "elf-file")
            .map(|(_, p)| p["base"].as_u64().unwrap())
            .collect();
        assert_eq!(bases.len(), 2);
        // Second target sits at least 8 pages above the first's free size.
        assert!(bases[1] >= bases[0] + 8 * crate::PAGE_SIZE);
        assert_eq!(bases[1] % crate::PAGE_SIZE, 0);

        let trampolines: Vec<_> = messages
            .iter()
            .filter(|(m, _)| m == "call-trampoline")
            .collect();
        assert_eq!(trampolines.len(), 2);
    }

    #[test]
    fn test_csv_driven_call_patches_listed_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("probe.bin");
        std::fs::write(&probe, tiny_elf(&[0xc3])).unwrap();
        // Two addresses of four nops are listed as hot.
        let csv = dir.path().join("hot.csv");
        std::fs::write(
            &csv,
            format!("{},1\n{},2\n", TEXT_VADDR, TEXT_VADDR + 2),
        )
        .unwrap();
        let base = dir.path().join("hot");

        let m = format!("addr=\"{}\"[0]", base.display());
        let a = format!("call[clean,before]probe(addr)@{}", probe.display());
        let messages = drive(&[0x90, 0x90, 0x90, 0x90], &[(&[m.as_str()], a.as_str())]);

        let patches: Vec<u64> = messages
            .iter()
            .filter(|(m, _)| m == "patch")
            .map(|(_, p)| p["offset"].as_u64().unwrap() - TEXT_OFFSET)
            .collect();
        assert_eq!(patches, vec![2, 0]);
    }

    #[test]
    fn test_fixed_seed_streams_are_identical() {
        let text = [0x90, 0xc3, 0x90, 0xc3];
        let groups: &[(&[&str], &str)] =
            &[(&["random>=0", "return"], "trap"), (&["true"], "passthru")];
        let first = drive(&text, groups);
        let second = drive(&text, groups);
        assert_eq!(first, second);
    }
}
