//! Core types, rule language, and emission planner for the resplice
//! binary-rewriter front-end.
//!
//! resplice drives a separate patch backend: it disassembles the code
//! section of an x86-64 ELF file, selects instructions with declarative
//! match/action rules, and describes the requested rewrites as an ordered
//! directive stream on the backend's standard input. The driver never
//! rewrites bytes itself.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use rand::SeedableRng;
//! use resplice::{
//!     elf::Elf,
//!     disasm::{Disassembler, Syntax},
//!     rules::{needs_detail, parser::ParserCtx},
//!     plugin::PluginTable,
//!     csv::CsvCache,
//!     backend::Backend,
//!     emit::Planner,
//!     pipeline,
//! };
//!
//! let mut plugins = PluginTable::new();
//! let mut csvs = CsvCache::new();
//! let mut entries = Vec::new();
//! let mut ctx = ParserCtx { plugins: &mut plugins, csvs: &mut csvs };
//!
//! // Build one rule: trap every return instruction.
//! resplice::rules::parser::parse_match("return", &mut ctx, &mut entries).unwrap();
//! let action = resplice::rules::parser::parse_action("trap", entries, &mut ctx).unwrap();
//! let actions = vec![action];
//!
//! // Drive the pipeline and emit the directive stream.
//! let elf = Elf::parse("path/to/binary", 0).unwrap();
//! let dis = Disassembler::new(Syntax::Att, needs_detail(&actions)).unwrap();
//! let mut backend = Backend::spawn("e9patch", &[]).unwrap();
//! let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(resplice::RNG_SEED);
//!
//! backend.send_binary("exe", "path/to/binary").unwrap();
//! let mut planner = Planner::new(&elf);
//! planner.prepare(&mut backend, &actions).unwrap();
//! let mut locs = pipeline::scan(
//!     &elf, &dis, &actions, &mut plugins, &mut rng, Some(0), &mut backend).unwrap();
//! planner.emit_patches(
//!     &mut backend, &elf, &dis, &actions, &mut locs,
//!     &mut plugins, &mut rng, &csvs).unwrap();
//! backend.send_emit("a.out", "binary", 4096).unwrap();
//! backend.wait().unwrap();
//! ```

pub mod args;
pub mod backend;
pub mod csv;
pub mod disasm;
pub mod elf;
pub mod emit;
pub mod metadata;
pub mod pipeline;
pub mod plugin;
pub mod rules;

#[cfg(test)]
pub(crate) mod testelf;

/// Maximum instruction size in bytes (x86-64 caps at 15; one spare).
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Maximum number of operands a rule may index.
pub const MAX_OPERANDS: usize = 8;

/// Maximum number of actions accepted on one command line.
pub const MAX_ACTIONS: usize = 1 << 10;

/// Page size assumed for secondary-ELF layout and mapping sizes.
pub const PAGE_SIZE: u64 = 4096;

/// Fixed seed for the driver's random source, so `random` attributes and
/// arguments are reproducible across runs on the same input.
pub const RNG_SEED: u64 = 0xE9E9_E9E9;

/// Error type shared by all driver subsystems.
///
/// Every user-facing failure carries a single complete diagnostic; the
/// binary prints it and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rule syntax error (bad token, invalid index, incompatible operator).
    #[error("failed to parse {0}")]
    Parse(String),

    /// Missing or malformed external resource (plugin, CSV, ELF).
    #[error("failed to load {0}")]
    Load(String),

    /// Valid syntax with inconsistent meaning (duplicate flags, bad range).
    #[error("{0}")]
    Semantic(String),

    /// The disassembler lost instruction sync and recovery was not enabled.
    #[error("failed to disassemble {0}")]
    Disasm(String),

    /// Backend spawn/exit failures and unwritable outputs.
    #[error("backend error: {0}")]
    Backend(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// One disassembled instruction slot in the pipeline's location buffer.
///
/// A plain record standing in for a 64-bit packed word; the packing
/// invariants still hold: offsets fit 48 bits, instructions are at most
/// 16 bytes, and action indices stay below [`MAX_ACTIONS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// Offset of the instruction relative to the start of the code section.
    pub offset: u64,
    /// Instruction size in bytes.
    pub size: u8,
    /// Set once the instruction message has been sent to the backend.
    pub emitted: bool,
    /// Index of the selected action, if any rule matched.
    pub action: Option<u16>,
}

impl Location {
    pub fn new(offset: u64, size: u8, action: Option<u16>) -> Self {
        assert!(offset < (1 << 48), "location offset exceeds 48 bits");
        assert!(size as usize <= MAX_INSTRUCTION_SIZE, "oversized instruction");
        if let Some(idx) = action {
            assert!((idx as usize) < MAX_ACTIONS, "action index out of range");
        }
        Location {
            offset,
            size,
            emitted: false,
            action,
        }
    }

    /// True if this location was selected for patching.
    pub fn patch(&self) -> bool {
        self.action.is_some()
    }
}
