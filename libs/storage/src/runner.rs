//! Running external tools (`dd`, `partclone.*`, `mkfs.*`, ...) and turning
//! their stderr chatter into progress events a caller can render.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;

use log::{debug, warn};
use regex::Regex;

use crate::error::RunnerError;

/// A line (or a handful of lines) of progress text plus, when derivable, a
/// completion ratio in `[0.0, 1.0]`.
#[derive(Debug, Clone, Default)]
pub struct ProgressFrame {
    pub lines: Vec<String>,
    pub ratio: Option<f64>,
}

/// Sink that a long-running command streams [`ProgressFrame`]s into.
///
/// Implemented by the CLI's `indicatif`-backed adapter; tests use a
/// `Vec<ProgressFrame>`-collecting sink.
pub trait ProgressSink {
    fn emit(&mut self, frame: ProgressFrame);
}

impl ProgressSink for Vec<ProgressFrame> {
    fn emit(&mut self, frame: ProgressFrame) {
        self.push(frame);
    }
}

/// A no-op sink for callers that don't care about progress.
pub struct NullSink;
impl ProgressSink for NullSink {
    fn emit(&mut self, _frame: ProgressFrame) {}
}

/// Where a streaming command's stdin comes from.
pub enum StdinSource<'a> {
    /// Pipe the given file open for reading into the child's stdin.
    File(&'a std::fs::File),
}

/// Options controlling a streaming run.
#[derive(Default)]
pub struct StreamOptions<'a> {
    pub stdin: Option<StdinSource<'a>>,
    pub total_bytes: Option<u64>,
    pub title: &'a str,
    pub subtitle: Option<&'a str>,
}

struct ProgressRegexes {
    bytes: Regex,
    percent: Regex,
    rate: Regex,
}

impl ProgressRegexes {
    fn new() -> Self {
        Self {
            bytes: Regex::new(r"(\d+)\s+bytes").unwrap(),
            percent: Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap(),
            rate: Regex::new(r"(\d+(?:\.\d+)?)\s*MiB/s").unwrap(),
        }
    }
}

/// Parses progress out of `dd`/`partclone`/`mkfs.ext4`-style stderr lines.
///
/// Tracks bytes-so-far separately from the last percent seen so that a line
/// carrying a new percent but no byte count (a phase transition, e.g. dd's
/// final summary line after a `status=progress` stream) never drags a stale
/// byte count forward as if it applied to the new phase.
struct ProgressState {
    re: ProgressRegexes,
    total_bytes: Option<u64>,
    last_bytes: Option<u64>,
    last_percent: Option<f64>,
    last_rate: Option<f64>,
    started: Instant,
}

impl ProgressState {
    fn new(total_bytes: Option<u64>) -> Self {
        Self {
            re: ProgressRegexes::new(),
            total_bytes,
            last_bytes: None,
            last_percent: None,
            last_rate: None,
            started: Instant::now(),
        }
    }

    fn ingest(&mut self, line: &str) -> ProgressFrame {
        let bytes = self
            .re
            .bytes
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());
        let percent = self
            .re
            .percent
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        let rate = self
            .re
            .rate
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());

        // A line with a percent but no bytes belongs to a new phase; don't
        // let a previous line's byte count leak into this frame's ratio.
        if percent.is_some() && bytes.is_none() {
            self.last_bytes = None;
        }
        if let Some(b) = bytes {
            self.last_bytes = Some(b);
        }
        if let Some(p) = percent {
            self.last_percent = Some(p);
        }
        if let Some(r) = rate {
            self.last_rate = Some(r);
        }

        let ratio = self
            .total_bytes
            .zip(self.last_bytes)
            .map(|(total, done)| {
                if total == 0 {
                    0.0
                } else {
                    done as f64 / total as f64
                }
            })
            .or_else(|| self.last_percent.map(|p| p / 100.0))
            .map(|r| r.clamp(0.0, 1.0));

        let mut lines = vec![line.to_string()];
        if let Some(rate) = self.last_rate {
            if let Some(ratio) = ratio {
                if ratio > 0.0 && ratio < 1.0 {
                    lines.push(format!("eta {}", format_eta(ratio, rate, self.started)));
                }
            }
        }

        ProgressFrame { lines, ratio }
    }
}

fn format_eta(ratio: f64, _rate_mib_s: f64, started: Instant) -> String {
    let elapsed = started.elapsed().as_secs_f64();
    let remaining_secs = if ratio > 0.0 {
        (elapsed / ratio) * (1.0 - ratio)
    } else {
        0.0
    };
    let total = remaining_secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Public wrapper around [`ProgressState`] for callers that build their own
/// multi-process pipelines (verification, Clonezilla restore) and need to
/// feed parsed lines through the same stale-bytes-safe logic `run_streaming`
/// uses internally.
pub struct ProgressParser(ProgressState);

impl ProgressParser {
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self(ProgressState::new(total_bytes))
    }

    pub fn ingest(&mut self, line: &str) -> ProgressFrame {
        self.0.ingest(line)
    }
}

/// Runs external commands used by the storage engines.
pub struct CommandRunner;

impl CommandRunner {
    /// Runs `argv` to completion, returning trimmed stdout on success.
    ///
    /// On non-zero exit, returns [`RunnerError::CommandFailed`] carrying the
    /// last non-empty stderr line (or stdout, if stderr was empty).
    pub fn run_checked(argv: &[&str], stdin: Option<&str>) -> Result<String, RunnerError> {
        let Some((bin, args)) = argv.split_first() else {
            return Ok(String::new());
        };
        debug!("running: {argv:?}");
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| map_spawn_error(bin, e))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            Ok(stdout)
        } else {
            let last_line = stderr
                .lines()
                .last()
                .unwrap_or(if stdout.is_empty() { "" } else { &stdout })
                .to_string();
            Err(RunnerError::CommandFailed {
                argv: argv.iter().map(|s| s.to_string()).collect(),
                last_stderr_line: last_line,
                exit_code: output.status.code(),
            })
        }
    }

    /// Runs `argv`, feeding parsed stderr lines to `sink` as they arrive.
    ///
    /// The child is always reaped before returning, including on error paths.
    pub fn run_streaming(
        argv: &[&str],
        opts: StreamOptions,
        sink: &mut dyn ProgressSink,
    ) -> Result<ExitStatus, RunnerError> {
        let Some((bin, args)) = argv.split_first() else {
            return Err(RunnerError::ToolMissing(String::new()));
        };
        debug!("streaming: {argv:?}");
        let mut cmd = Command::new(bin);
        cmd.args(args).stdout(Stdio::null()).stderr(Stdio::piped());
        cmd.stdin(match opts.stdin {
            Some(StdinSource::File(f)) => Stdio::from(f.try_clone()?),
            None => Stdio::null(),
        });

        let mut child = cmd.spawn().map_err(|e| map_spawn_error(bin, e))?;
        let guard = ChildGuard(&mut child);
        let mut state = ProgressState::new(opts.total_bytes);

        if let Some(title) = Some(opts.title).filter(|t| !t.is_empty()) {
            let mut lines = vec![title.to_string()];
            if let Some(sub) = opts.subtitle {
                lines.push(sub.to_string());
            }
            sink.emit(ProgressFrame { lines, ratio: None });
        }

        if let Some(stderr) = guard.0.stderr.take() {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                // dd's `status=progress` writes carriage returns, not newlines.
                match read_progress_chunk(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        let line = text.trim();
                        if !line.is_empty() {
                            sink.emit(state.ingest(line));
                        }
                    }
                    Err(e) => {
                        warn!("error reading command output: {e}");
                        break;
                    }
                }
            }
        }

        let status = guard.0.wait()?;
        drop(guard);
        Ok(status)
    }

    /// True if `name` resolves on `PATH`.
    pub fn tool_exists(name: &str) -> bool {
        Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

fn read_progress_chunk(reader: &mut impl BufRead, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut total = 0;
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        if byte[0] == b'\n' || byte[0] == b'\r' {
            if buf.is_empty() {
                continue;
            }
            return Ok(total);
        }
        buf.push(byte[0]);
    }
}

fn map_spawn_error(bin: &str, e: std::io::Error) -> RunnerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RunnerError::ToolMissing(bin.to_string())
    } else {
        RunnerError::Io(e)
    }
}

/// Ensures the child is reaped even if the caller bails out early.
struct ChildGuard<'a>(&'a mut Child);

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.try_wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dd_style_progress() {
        let mut state = ProgressState::new(Some(1_000_000));
        let frame = state.ingest("500000 bytes (500 kB, 488 KiB) copied, 1 s, 488 MiB/s");
        assert_eq!(frame.ratio, Some(0.5));
    }

    #[test]
    fn percent_without_bytes_does_not_reuse_stale_bytes() {
        let mut state = ProgressState::new(Some(1_000_000));
        state.ingest("900000 bytes copied");
        let frame = state.ingest("5%");
        assert_eq!(frame.ratio, Some(0.05));
    }

    #[test]
    fn ratio_is_clamped() {
        let mut state = ProgressState::new(Some(100));
        let frame = state.ingest("250 bytes copied");
        assert_eq!(frame.ratio, Some(1.0));
    }

    #[test]
    fn run_checked_reports_failure() {
        let err = CommandRunner::run_checked(&["false"], None).unwrap_err();
        assert!(matches!(err, RunnerError::CommandFailed { .. }));
    }

    #[test]
    fn run_checked_reports_missing_tool() {
        let err = CommandRunner::run_checked(&["definitely-not-a-real-binary"], None).unwrap_err();
        assert!(matches!(err, RunnerError::ToolMissing(_)));
    }

    #[test]
    fn run_checked_captures_stdout() {
        let out = CommandRunner::run_checked(&["echo", "hello"], None).unwrap();
        assert_eq!(out, "hello");
    }
}
