//! Dynamic-library plugin host.
//!
//! Plugins are shared objects exporting any subset of five versioned
//! C-ABI entry points: `e9_plugin_{init,instr,match,patch,fini}_v1`.
//! Libraries are cached by canonical path; reopening the same path returns
//! the cached instance. The presence of any `instr` hook switches the
//! pipeline into two-pass mode.
//!
//! Plugins receive the backend stream as a raw file descriptor (C code can
//! `fdopen` it), the ELF descriptor and disassembler as opaque pointers,
//! and the instruction as a `#[repr(C)]` view.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use libloading::Library;

use crate::disasm::Instruction;
use crate::elf::Elf;
use crate::{Error, Result, MAX_INSTRUCTION_SIZE};

/// Opaque per-plugin context, created by `init` and threaded through the
/// other hooks.
pub type RawContext = *mut c_void;

/// C view of one decoded instruction.
#[repr(C)]
pub struct RawInstruction {
    pub address: u64,
    pub size: u32,
    pub mnemonic: *const c_char,
    pub op_str: *const c_char,
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
}

type InitFn = unsafe extern "C" fn(c_int, *const c_void) -> RawContext;
type InstrFn =
    unsafe extern "C" fn(c_int, *const c_void, *const c_void, i64, *const RawInstruction, RawContext);
type MatchFn = unsafe extern "C" fn(
    c_int,
    *const c_void,
    *const c_void,
    i64,
    *const RawInstruction,
    RawContext,
) -> i64;
type PatchFn = InstrFn;
type FiniFn = unsafe extern "C" fn(c_int, *const c_void, RawContext);

/// One loaded plugin library with its resolved entry points.
///
/// The entry points are plain function pointers copied out of the loaded
/// library; `_lib` keeps the mapping alive for as long as they are
/// callable.
pub struct Plugin {
    pub path: PathBuf,
    init: Option<InitFn>,
    instr: Option<InstrFn>,
    matcher: Option<MatchFn>,
    patcher: Option<PatchFn>,
    fini: Option<FiniFn>,
    context: RawContext,
    result: i64,
    _lib: Library,
}

impl Plugin {
    pub fn has_match(&self) -> bool {
        self.matcher.is_some()
    }

    pub fn has_instr(&self) -> bool {
        self.instr.is_some()
    }

    pub fn has_patch(&self) -> bool {
        self.patcher.is_some()
    }
}

/// Dispatch seam between the pipeline and the plugin set, so pipeline
/// behavior can be exercised without compiled shared objects.
pub trait PluginHost {
    /// True when any loaded plugin exports an `instr` hook.
    fn two_pass(&self) -> bool;

    /// Notify every `instr` hook of a new instruction (pass one of
    /// two-pass mode).
    fn notify_all(
        &mut self,
        out: RawFd,
        elf: &Elf,
        handle: *const c_void,
        offset: i64,
        insn: &Instruction,
    );

    /// Ask every `match` hook for its value; results are snapshotted for
    /// the rule evaluator.
    fn match_all(
        &mut self,
        out: RawFd,
        elf: &Elf,
        handle: *const c_void,
        offset: i64,
        insn: &Instruction,
    );

    /// Snapshotted `match` result of one plugin.
    fn result(&self, id: usize) -> i64;

    /// Delegate patch emission to a plugin; false when the plugin exports
    /// no `patch` hook.
    fn patch(
        &mut self,
        id: usize,
        out: RawFd,
        elf: &Elf,
        handle: *const c_void,
        offset: i64,
        insn: &Instruction,
    ) -> bool;
}

/// Process-wide plugin table, append-only, keyed by canonical path.
#[derive(Default)]
pub struct PluginTable {
    plugins: Vec<Plugin>,
    by_path: HashMap<PathBuf, usize>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn get(&self, id: usize) -> &Plugin {
        &self.plugins[id]
    }

    /// Open (or return the cached) plugin named `basename`; the `.so`
    /// suffix is appended when missing.
    pub fn open(&mut self, basename: &str) -> Result<usize> {
        let mut filename = basename.to_string();
        if !filename.ends_with(".so") {
            filename.push_str(".so");
        }
        let path = std::fs::canonicalize(&filename).map_err(|e| {
            Error::Load(format!("plugin \"{}\"; {}", basename, e))
        })?;
        if let Some(&id) = self.by_path.get(&path) {
            return Ok(id);
        }

        // SAFETY: loading a shared object runs its constructors; plugins
        // are trusted code named by the user on the command line.
        let lib = unsafe { Library::new(&path) }.map_err(|e| {
            Error::Load(format!("plugin \"{}\": {}", path.display(), e))
        })?;

        // SAFETY: the signatures match the documented plugin ABI; the
        // symbols never outlive `_lib` below.
        let plugin = unsafe {
            Plugin {
                init: resolve(&lib, b"e9_plugin_init_v1\0"),
                instr: resolve(&lib, b"e9_plugin_instr_v1\0"),
                matcher: resolve(&lib, b"e9_plugin_match_v1\0"),
                patcher: resolve(&lib, b"e9_plugin_patch_v1\0"),
                fini: resolve(&lib, b"e9_plugin_fini_v1\0"),
                context: std::ptr::null_mut(),
                result: 0,
                path: path.clone(),
                _lib: lib,
            }
        };
        if plugin.init.is_none()
            && plugin.instr.is_none()
            && plugin.matcher.is_none()
            && plugin.patcher.is_none()
            && plugin.fini.is_none()
        {
            return Err(Error::Load(format!(
                "plugin \"{}\"; the shared object does not export any plugin \
                 API functions",
                path.display()
            )));
        }

        let id = self.plugins.len();
        self.plugins.push(plugin);
        self.by_path.insert(path, id);
        Ok(id)
    }

    /// Run every `init` hook; returned contexts are retained.
    pub fn init_all(&mut self, out: RawFd, elf: &Elf) {
        let elf_ptr = elf as *const Elf as *const c_void;
        for plugin in &mut self.plugins {
            if let Some(init) = plugin.init {
                // SAFETY: ABI contract; see module docs.
                plugin.context = unsafe { init(out, elf_ptr) };
            }
        }
    }

    /// Run every `fini` hook; contexts are dead afterwards.
    pub fn fini_all(&mut self, out: RawFd, elf: &Elf) {
        let elf_ptr = elf as *const Elf as *const c_void;
        for plugin in &mut self.plugins {
            if let Some(fini) = plugin.fini {
                // SAFETY: ABI contract; context came from this plugin's init.
                unsafe { fini(out, elf_ptr, plugin.context) };
            }
            plugin.context = std::ptr::null_mut();
        }
    }
}

unsafe fn resolve<T: Copy>(lib: &Library, symbol: &[u8]) -> Option<T> {
    lib.get::<T>(symbol).ok().map(|s| *s)
}

fn raw_instruction(insn: &Instruction, mnemonic: &CString, op_str: &CString) -> RawInstruction {
    RawInstruction {
        address: insn.addr,
        size: insn.size as u32,
        mnemonic: mnemonic.as_ptr(),
        op_str: op_str.as_ptr(),
        bytes: insn.bytes,
    }
}

impl PluginHost for PluginTable {
    fn two_pass(&self) -> bool {
        self.plugins.iter().any(Plugin::has_instr)
    }

    fn notify_all(
        &mut self,
        out: RawFd,
        elf: &Elf,
        handle: *const c_void,
        offset: i64,
        insn: &Instruction,
    ) {
        let elf_ptr = elf as *const Elf as *const c_void;
        let mnemonic = CString::new(insn.mnemonic.as_str()).unwrap_or_default();
        let op_str = CString::new(insn.op_str.as_str()).unwrap_or_default();
        let raw = raw_instruction(insn, &mnemonic, &op_str);
        for plugin in &mut self.plugins {
            if let Some(instr) = plugin.instr {
                // SAFETY: ABI contract; `raw` outlives the call.
                unsafe { instr(out, elf_ptr, handle, offset, &raw, plugin.context) };
            }
        }
    }

    fn match_all(
        &mut self,
        out: RawFd,
        elf: &Elf,
        handle: *const c_void,
        offset: i64,
        insn: &Instruction,
    ) {
        let elf_ptr = elf as *const Elf as *const c_void;
        let mnemonic = CString::new(insn.mnemonic.as_str()).unwrap_or_default();
        let op_str = CString::new(insn.op_str.as_str()).unwrap_or_default();
        let raw = raw_instruction(insn, &mnemonic, &op_str);
        for plugin in &mut self.plugins {
            if let Some(matcher) = plugin.matcher {
                // SAFETY: ABI contract; `raw` outlives the call.
                plugin.result =
                    unsafe { matcher(out, elf_ptr, handle, offset, &raw, plugin.context) };
            }
        }
    }

    fn result(&self, id: usize) -> i64 {
        self.plugins[id].result
    }

    fn patch(
        &mut self,
        id: usize,
        out: RawFd,
        elf: &Elf,
        handle: *const c_void,
        offset: i64,
        insn: &Instruction,
    ) -> bool {
        let plugin = &mut self.plugins[id];
        let Some(patcher) = plugin.patcher else {
            return false;
        };
        let elf_ptr = elf as *const Elf as *const c_void;
        let mnemonic = CString::new(insn.mnemonic.as_str()).unwrap_or_default();
        let op_str = CString::new(insn.op_str.as_str()).unwrap_or_default();
        let raw = raw_instruction(insn, &mnemonic, &op_str);
        // SAFETY: ABI contract; `raw` outlives the call.
        unsafe { patcher(out, elf_ptr, handle, offset, &raw, plugin.context) };
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table() {
        let table = PluginTable::new();
        assert!(table.is_empty());
        assert!(!table.two_pass());
    }

    #[test]
    fn test_open_missing_plugin() {
        let mut table = PluginTable::new();
        let err = table.open("/nonexistent/plugin").unwrap_err();
        assert!(matches!(err, Error::Load(_)));
    }

    #[test]
    fn test_open_rejects_non_plugin_library() {
        // A real shared object that certainly exports none of the plugin
        // entry points.
        let candidates = [
            "/lib/x86_64-linux-gnu/libm.so.6",
            "/usr/lib/x86_64-linux-gnu/libm.so.6",
            "/lib64/libm.so.6",
        ];
        let Some(lib) = candidates.iter().find(|p| std::path::Path::new(p).exists())
        else {
            return;
        };
        let mut table = PluginTable::new();
        let err = table.open(lib).unwrap_err();
        assert!(err
            .to_string()
            .contains("does not export any plugin API functions"));
    }
}
