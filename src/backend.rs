//! Patch-backend process management and the directive stream.
//!
//! The backend consumes one JSON object per line on its standard input.
//! With `--format json` no child is spawned; the stream goes to a file (or
//! stdout) instead. Message kinds and their required ordering are fixed:
//! `binary`, `elf-file`, `call-trampoline`, the builtin trampolines,
//! `instruction`/`patch`, and finally `emit`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use serde_json::{json, Value};

use crate::args::Argument;
use crate::elf::Elf;
use crate::rules::CallKind;
use crate::{Error, Result};

/// The backend stream plus the child process feeding on it, if any.
pub struct Backend {
    out: BufWriter<Box<dyn Write + Send>>,
    fd: RawFd,
    child: Option<Child>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("fd", &self.fd).finish()
    }
}

impl Backend {
    /// Spawn the backend program with the directive stream on its stdin.
    pub fn spawn(prog: &str, options: &[String]) -> Result<Backend> {
        let mut child = Command::new(prog)
            .args(options)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Backend(format!("failed to spawn backend \"{}\": {}", prog, e))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Backend("failed to open backend stdin".to_string()))?;
        let fd = stdin.as_raw_fd();
        Ok(Backend {
            out: BufWriter::new(Box::new(stdin)),
            fd,
            child: Some(child),
        })
    }

    /// Write the stream to a file instead of a child process.
    pub fn to_file(path: &Path) -> Result<Backend> {
        let file = File::create(path).map_err(|e| {
            Error::Backend(format!(
                "failed to open output file \"{}\": {}",
                path.display(),
                e
            ))
        })?;
        let fd = file.as_raw_fd();
        Ok(Backend {
            out: BufWriter::new(Box::new(file)),
            fd,
            child: None,
        })
    }

    /// Write the stream to standard output.
    pub fn to_stdout() -> Backend {
        Backend {
            out: BufWriter::new(Box::new(io::stdout())),
            fd: 1,
            child: None,
        }
    }

    /// Write the stream to an arbitrary writer (no usable descriptor).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Backend {
        Backend {
            out: BufWriter::new(writer),
            fd: -1,
            child: None,
        }
    }

    /// Raw descriptor of the stream, handed to plugins.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Flush buffered directives; required before any plugin call that
    /// receives the stream descriptor.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Close the stream and wait for the child to finish; a non-zero exit
    /// aborts.
    pub fn wait(self) -> Result<()> {
        let Backend { mut out, child, .. } = self;
        out.flush()?;
        drop(out);
        if let Some(mut child) = child {
            let status = child
                .wait()
                .map_err(|e| Error::Backend(format!("failed to wait for backend: {}", e)))?;
            if !status.success() {
                return Err(Error::Backend(format!(
                    "backend exited with {}",
                    status
                )));
            }
        }
        Ok(())
    }

    fn send(&mut self, method: &str, params: Value) -> Result<()> {
        writeln!(self.out, "{}", json!({ "method": method, "params": params }))?;
        Ok(())
    }

    pub fn send_binary(&mut self, mode: &str, path: &str) -> Result<()> {
        self.send("binary", json!({ "mode": mode, "path": path }))
    }

    /// Announce a secondary ELF mapped at its assigned base.
    pub fn send_elf_file(&mut self, elf: &Elf) -> Result<()> {
        self.send(
            "elf-file",
            json!({
                "path": elf.path.display().to_string(),
                "base": elf.base,
                "size": elf.free_addr,
            }),
        )
    }

    /// Define a call trampoline: argument descriptors, frame policy, and
    /// call position.
    pub fn send_call_trampoline(
        &mut self,
        name: &str,
        args: &[Argument],
        clean: bool,
        call: CallKind,
    ) -> Result<()> {
        let args: Vec<Value> = args
            .iter()
            .map(|arg| {
                json!({
                    "kind": arg.kind.name(),
                    "ptr": arg.ptr,
                    "dup": arg.duplicate,
                })
            })
            .collect();
        self.send(
            "call-trampoline",
            json!({
                "name": name,
                "args": args,
                "clean": clean,
                "position": call.name(),
            }),
        )
    }

    pub fn send_passthru_trampoline(&mut self) -> Result<()> {
        self.send("passthru-trampoline", json!({ "name": "passthru" }))
    }

    pub fn send_print_trampoline(&mut self) -> Result<()> {
        self.send("print-trampoline", json!({ "name": "print" }))
    }

    pub fn send_trap_trampoline(&mut self) -> Result<()> {
        self.send("trap-trampoline", json!({ "name": "trap" }))
    }

    /// Describe one original instruction (address, size, file offset).
    pub fn send_instruction(&mut self, addr: u64, size: u8, offset: u64) -> Result<()> {
        self.send(
            "instruction",
            json!({ "address": addr, "size": size, "offset": offset }),
        )
    }

    /// Request one patch at a file offset, naming the trampoline and
    /// carrying the resolved argument metadata, if any.
    pub fn send_patch(
        &mut self,
        trampoline: &str,
        offset: u64,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.send(
            "patch",
            json!({
                "trampoline": trampoline,
                "offset": offset,
                "metadata": metadata,
            }),
        )
    }

    pub fn send_emit(&mut self, path: &str, format: &str, mapping_size: u64) -> Result<()> {
        self.send(
            "emit",
            json!({ "path": path, "format": format, "mapping_size": mapping_size }),
        )
    }
}
