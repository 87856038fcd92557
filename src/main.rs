//! resplice: front-end driver for a static x86-64 ELF binary rewriter.
//!
//! Disassembles the code section of the input ELF, selects instructions
//! with `--match`/`--action` rule groups, and streams rewrite directives
//! to the patch backend (or a JSON file with `--format json`).

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use resplice::backend::Backend;
use resplice::csv::CsvCache;
use resplice::disasm::{Disassembler, Syntax};
use resplice::elf::{is_library_filename, Elf};
use resplice::emit::Planner;
use resplice::pipeline;
use resplice::plugin::{PluginHost, PluginTable};
use resplice::rules::parser::{parse_action, parse_match, ParserCtx};
use resplice::rules::{needs_detail, Action};
use resplice::{MAX_ACTIONS, PAGE_SIZE, RNG_SEED};

const FORMATS: &[&str] = &["binary", "json", "patch", "patch.gz", "patch.bz2", "patch.xz"];

#[derive(Parser)]
#[command(name = "resplice", version, about)]
struct Cli {
    /// Instruction matching; repeatable, ANDed within one action group.
    #[arg(short = 'M', long = "match", value_name = "MATCH", id = "matches")]
    matches: Vec<String>,

    /// Action for instructions matching the preceding `--match` options.
    #[arg(short = 'A', long = "action", value_name = "ACTION", id = "actions")]
    actions: Vec<String>,

    /// Backend program consuming the directive stream.
    #[arg(long, default_value = "e9patch", value_name = "PROG")]
    backend: String,

    /// Compression level (0..9); higher means a smaller output binary but
    /// more mappings.
    #[arg(short = 'c', long, default_value_t = 9, value_name = "N")]
    compression: u32,

    /// Trace rule matching per instruction.
    #[arg(long)]
    debug: bool,

    /// Patch the code section only up to this address or dynamic symbol.
    #[arg(long, value_name = "END")]
    end: Option<String>,

    /// Treat the input as an executable, even if it looks like a library.
    #[arg(long)]
    executable: bool,

    /// Output format.
    #[arg(long, default_value = "binary", value_name = "FORMAT")]
    format: String,

    /// Suppress warning messages.
    #[arg(long = "no-warnings")]
    no_warnings: bool,

    /// Extra option passed through to the backend; repeatable.
    #[arg(long = "option", value_name = "OPTION")]
    options: Vec<String>,

    /// Output file path.
    #[arg(short = 'o', long, default_value = "a.out", value_name = "FILE")]
    output: String,

    /// Treat the input as a shared library, even if it looks like an
    /// executable.
    #[arg(long)]
    shared: bool,

    /// Patch the code section only from this address or dynamic symbol.
    #[arg(long, value_name = "START")]
    start: Option<String>,

    /// Replace patched pages statically instead of at load time.
    #[arg(short = 's', long = "static-loader")]
    static_loader: bool,

    /// Skip N instructions after a disassembler desync instead of failing.
    #[arg(long, value_name = "N")]
    sync: Option<u32>,

    /// Assembly syntax (ATT or intel).
    #[arg(long, default_value = "ATT", value_name = "SYNTAX")]
    syntax: String,

    /// Insert a trap at each trampoline entry (for debugging).
    #[arg(long = "trap-all")]
    trap_all: bool,

    /// Input ELF executable or shared object.
    #[arg(value_name = "input-file")]
    input: String,
}

fn main() {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    let level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.no_warnings {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli, &matches) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

/// Rebuild the interleaved `-M`/`-A` groups from the raw argument
/// indices: each action consumes every match seen since the previous one.
fn build_rules(
    cli: &Cli,
    matches: &clap::ArgMatches,
    ctx: &mut ParserCtx<'_>,
) -> Result<Vec<Action>> {
    #[derive(Clone, Copy)]
    enum Event {
        Match,
        Action,
    }
    let mut events: Vec<(usize, Event)> = Vec::new();
    if let Some(indices) = matches.indices_of("matches") {
        events.extend(indices.map(|i| (i, Event::Match)));
    }
    if let Some(indices) = matches.indices_of("actions") {
        events.extend(indices.map(|i| (i, Event::Action)));
    }
    events.sort_by_key(|(i, _)| *i);

    let mut actions = Vec::new();
    let mut entries = Vec::new();
    let (mut mi, mut ai) = (0, 0);
    for (_, event) in events {
        match event {
            Event::Match => {
                parse_match(&cli.matches[mi], ctx, &mut entries)?;
                mi += 1;
            }
            Event::Action => {
                let action = parse_action(&cli.actions[ai], std::mem::take(&mut entries), ctx)?;
                actions.push(action);
                ai += 1;
            }
        }
    }
    if !entries.is_empty() {
        bail!(
            "failed to parse command-line arguments; detected extraneous matching \
             option(s) (`--match' or `-M') that are not paired with a \
             corresponding action (`--action' or `-A')"
        );
    }
    if actions.len() > MAX_ACTIONS {
        bail!(
            "failed to parse command-line arguments; the total number of actions \
             ({}) exceeds the maximum ({})",
            actions.len(),
            MAX_ACTIONS
        );
    }
    Ok(actions)
}

/// Append the format-specific suffix to the output path when missing.
fn output_with_suffix(output: &str, format: &str) -> String {
    let suffix = match format {
        "patch" => ".patch",
        "patch.gz" => ".patch.gz",
        "patch.bz2" => ".patch.bz2",
        "patch.xz" => ".patch.xz",
        _ => return output.to_string(),
    };
    if output.ends_with(suffix) {
        output.to_string()
    } else {
        format!("{}{}", output, suffix)
    }
}

fn run(cli: Cli, matches: &clap::ArgMatches) -> Result<()> {
    if cli.compression > 9 {
        bail!(
            "bad value \"{}\" for `--compression' option; expected a number 0..9",
            cli.compression
        );
    }
    if let Some(sync) = cli.sync {
        if sync > 1000 {
            bail!(
                "bad value \"{}\" for `--sync' option; expected an integer 0..1000",
                sync
            );
        }
    }
    if !FORMATS.contains(&cli.format.as_str()) {
        bail!(
            "bad value \"{}\" for `--format' option; expected one of {}",
            cli.format,
            FORMATS
                .iter()
                .map(|f| format!("\"{}\"", f))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    let syntax: Syntax = cli
        .syntax
        .parse()
        .map_err(|e: String| anyhow::anyhow!("bad value for `--syntax' option; {}", e))?;
    if cli.shared && cli.executable {
        bail!(
            "failed to parse command-line arguments; both the `--shared' and \
             `--executable' options cannot be used at the same time"
        );
    }

    let mut plugins = PluginTable::new();
    let mut csvs = CsvCache::new();
    let actions = {
        let mut ctx = ParserCtx {
            plugins: &mut plugins,
            csvs: &mut csvs,
        };
        build_rules(&cli, matches, &mut ctx)?
    };

    let mut rng = ChaCha20Rng::seed_from_u64(RNG_SEED);

    let mut elf = Elf::parse(&cli.input, 0)?;

    // Executable-vs-shared heuristic, overridable by flags: dynamic ELFs
    // named lib*.so[.VERSION] are shared, all others executables.
    let mode = if cli.executable {
        "exe"
    } else if cli.shared || (elf.dso && is_library_filename(&cli.input)) {
        "dso"
    } else {
        "exe"
    };

    let mut backend_options = cli.options.clone();
    if cli.static_loader {
        backend_options.push("--static-loader".to_string());
    }
    if cli.trap_all {
        backend_options.push("--trap-all".to_string());
    }
    backend_options.push("--experimental".to_string());

    let mut backend = if cli.format == "json" {
        if cli.output == "-" {
            Backend::to_stdout()
        } else {
            let filename = if cli.output.ends_with(".json") {
                cli.output.clone()
            } else {
                format!("{}.json", cli.output)
            };
            Backend::to_file(std::path::Path::new(&filename))?
        }
    } else {
        Backend::spawn(&cli.backend, &backend_options)?
    };

    backend.send_binary(mode, &cli.input)?;

    backend.flush()?;
    plugins.init_all(backend.raw_fd(), &elf);

    let mut planner = Planner::new(&elf);
    planner.prepare(&mut backend, &actions)?;

    // Restrict the disassembly window, if requested.
    if let Some(start) = &cli.start {
        let addr = elf.resolve_position("--start", start)?;
        elf.restrict_start(addr)?;
    }
    if let Some(end) = &cli.end {
        let addr = elf.resolve_position("--end", end)?;
        elf.restrict_end(addr)?;
    }

    let dis = Disassembler::new(syntax, needs_detail(&actions))?;
    let mut locs = pipeline::scan(
        &elf,
        &dis,
        &actions,
        &mut plugins,
        &mut rng,
        cli.sync,
        &mut backend,
    )?;
    if plugins.two_pass() {
        pipeline::rescan(
            &elf,
            &dis,
            &actions,
            &mut plugins,
            &mut rng,
            &mut locs,
            &mut backend,
        )?;
    }

    planner.emit_patches(
        &mut backend,
        &elf,
        &dis,
        &actions,
        &mut locs,
        &mut plugins,
        &mut rng,
        &csvs,
    )?;

    backend.flush()?;
    plugins.fini_all(backend.raw_fd(), &elf);

    // The JSON pseudo-backend already wrote the stream; the emit message
    // still names the binary the backend would have produced.
    let (output, format) = if cli.format == "json" {
        ("a.out".to_string(), "binary".to_string())
    } else {
        (output_with_suffix(&cli.output, &cli.format), cli.format.clone())
    };
    let mapping_size = PAGE_SIZE * (1u64 << (9 - cli.compression));
    backend.send_emit(&output, &format, mapping_size)?;

    backend
        .wait()
        .context("the backend did not complete successfully")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_suffix_fixup() {
        assert_eq!(output_with_suffix("a.out", "binary"), "a.out");
        assert_eq!(output_with_suffix("a.out", "patch"), "a.out.patch");
        assert_eq!(output_with_suffix("a.out.patch", "patch"), "a.out.patch");
        assert_eq!(output_with_suffix("x", "patch.xz"), "x.patch.xz");
        assert_eq!(output_with_suffix("x.patch.gz", "patch.gz"), "x.patch.gz");
    }

    #[test]
    fn test_cli_parses_rule_groups() {
        let cli = Cli::try_parse_from([
            "resplice", "-M", "return", "-A", "trap", "-M", "call", "-M", "size=5",
            "-A", "print", "input.bin",
        ])
        .unwrap();
        assert_eq!(cli.matches.len(), 3);
        assert_eq!(cli.actions.len(), 2);
        assert_eq!(cli.input, "input.bin");
        assert_eq!(cli.compression, 9);
        assert_eq!(cli.backend, "e9patch");
    }

    #[test]
    fn test_cli_rejects_missing_input() {
        assert!(Cli::try_parse_from(["resplice", "-M", "return", "-A", "trap"]).is_err());
    }
}
