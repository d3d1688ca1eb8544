// Copyright © 2024 Axis Communications AB
//
// SPDX-License-Identifier: Apache-2.0

//! The control channel between the test harness and the model layer.
//!
//! The harness appends lines to `control.txt` in the work directory; we
//! tail the file and apply every complete line once per event-loop wake.
//! Lines starting with `# ` are log messages from the harness, echoed
//! into our log so both sides of a test run end up in one place. Every
//! other line is a command:
//!
//! ```text
//! <surface>.<method> [arg ...]
//! ```
//!
//! where `surface` is `i2c`, `gpio` or `platform` and arguments are
//! integers (decimal or `0x` hex), bare words, or `key=value` pairs.
//! The format is internal to the harness and unversioned.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

use thiserror::Error as ThisError;

pub const CONTROL_FILE: &str = "control.txt";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed command {0:?}")]
    Malformed(String),
    #[error("bad integer {0:?}")]
    BadInteger(String),
    #[error("missing argument {0}")]
    MissingArgument(&'static str),
}

type Result<T> = std::result::Result<T, Error>;

/// Parsed command arguments: positional words plus `key=value` pairs.
#[derive(Debug, Default, Clone)]
pub struct Args {
    positional: Vec<String>,
    kv: HashMap<String, String>,
}

/// Parse an integer that may be decimal or `0x`-prefixed hex.
pub fn parse_int(s: &str) -> Result<u64> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|_| Error::BadInteger(s.to_string()))
}

impl Args {
    pub fn parse(tokens: &[&str]) -> Result<Args> {
        let mut args = Args::default();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    args.kv.insert(key.to_string(), value.to_string());
                }
                _ => args.positional.push(token.to_string()),
            }
        }
        Ok(args)
    }

    pub fn pos_len(&self) -> usize {
        self.positional.len()
    }

    pub fn pos_str(&self, index: usize, what: &'static str) -> Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or(Error::MissingArgument(what))
    }

    pub fn pos_int(&self, index: usize, what: &'static str) -> Result<u64> {
        parse_int(self.pos_str(index, what)?)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.kv.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<u64>> {
        self.kv.get(key).map(|v| parse_int(v)).transpose()
    }

    pub fn int_or(&self, key: &str, default: u64) -> Result<u64> {
        Ok(self.get_int(key)?.unwrap_or(default))
    }
}

/// One decoded control line.
#[derive(Debug)]
pub enum ControlLine {
    /// A `# `-prefixed harness log message.
    Log(String),
    /// A command for one of the model surfaces.
    Command {
        surface: String,
        method: String,
        args: Args,
    },
}

pub fn parse_line(line: &str) -> Result<Option<ControlLine>> {
    let line = line.trim_end();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(msg) = line.strip_prefix("# ") {
        return Ok(Some(ControlLine::Log(msg.to_string())));
    }

    let mut tokens = line.split_whitespace();
    let head = tokens.next().ok_or_else(|| Error::Malformed(line.to_string()))?;
    let (surface, method) = head
        .split_once('.')
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    if surface.is_empty() || method.is_empty() {
        return Err(Error::Malformed(line.to_string()));
    }

    let rest: Vec<&str> = tokens.collect();
    Ok(Some(ControlLine::Command {
        surface: surface.to_string(),
        method: method.to_string(),
        args: Args::parse(&rest)?,
    }))
}

/// Tails the control file.
///
/// The harness may be mid-write when we read, so a trailing fragment
/// without a newline is buffered and completed on a later poll.
pub struct ControlReader {
    file: File,
    partial: String,
}

impl ControlReader {
    /// Create (truncating any stale content) and open the control file.
    pub fn new(work_dir: &Path) -> std::io::Result<Self> {
        let path = work_dir.join(CONTROL_FILE);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let file = File::open(&path)?;
        Ok(ControlReader {
            file,
            partial: String::new(),
        })
    }

    /// Return all complete lines appended since the last poll.
    pub fn poll_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut chunk = String::new();
        self.file.read_to_string(&mut chunk)?;
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        self.partial.push_str(&chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches('\n').to_string());
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_integers() {
        assert_eq!(parse_int("42").unwrap(), 42);
        assert_eq!(parse_int("0x2a").unwrap(), 0x2a);
        assert_eq!(parse_int("0X2A").unwrap(), 0x2a);
        assert!(parse_int("fish").is_err());
        assert!(parse_int("0x").is_err());
    }

    #[test]
    fn parse_command_line() {
        let line = parse_line("i2c.load_model simple-smbus regbytes=1 regs=0x00:0x12")
            .unwrap()
            .unwrap();
        match line {
            ControlLine::Command {
                surface,
                method,
                args,
            } => {
                assert_eq!(surface, "i2c");
                assert_eq!(method, "load_model");
                assert_eq!(args.pos_str(0, "model").unwrap(), "simple-smbus");
                assert_eq!(args.int_or("regbytes", 0).unwrap(), 1);
                assert_eq!(args.get_str("regs").unwrap(), "0x00:0x12");
            }
            other => panic!("unexpected line {:?}", other),
        }
    }

    #[test]
    fn parse_log_and_blank_lines() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        match parse_line("# hello from the harness").unwrap().unwrap() {
            ControlLine::Log(msg) => assert_eq!(msg, "hello from the harness"),
            other => panic!("unexpected line {:?}", other),
        }
    }

    #[test]
    fn reject_garbage() {
        assert!(parse_line("noseparator").is_err());
        assert!(parse_line(".method").is_err());
        assert!(parse_line("surface.").is_err());
    }

    #[test]
    fn reader_handles_partial_writes() {
        let dir = std::env::temp_dir().join(format!("roadtest-ctrl-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut reader = ControlReader::new(&dir).unwrap();

        let mut writer = OpenOptions::new()
            .append(true)
            .open(dir.join(CONTROL_FILE))
            .unwrap();

        writer.write_all(b"gpio.set_input 3 1\ngpio.un").unwrap();
        let lines = reader.poll_lines().unwrap();
        assert_eq!(lines, vec!["gpio.set_input 3 1".to_string()]);

        writer.write_all(b"mask 3\n").unwrap();
        let lines = reader.poll_lines().unwrap();
        assert_eq!(lines, vec!["gpio.unmask 3".to_string()]);

        assert!(reader.poll_lines().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
