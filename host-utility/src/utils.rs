use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::constants::ORANGE;

/// Calculate terminal display width, treating emojis as 2 cells wide.
fn terminal_width(s: &str) -> usize {
    use unicode_width::UnicodeWidthChar;
    s.chars()
        .map(|c| {
            if c.is_ascii() {
                1
            } else {
                let w = UnicodeWidthChar::width(c).unwrap_or(0);
                if w > 0 { 2 } else { 0 }
            }
        })
        .sum()
}

/// Print a styled title bar with an orange separator matching the title width.
pub fn print_title_bar(title: &str) {
    println!("{}", title.bold().bright_white());
    let width = terminal_width(title);
    let separator: String = "─".repeat(width);
    println!("{}", separator.truecolor(ORANGE.0, ORANGE.1, ORANGE.2));
}

/// Print a subdued subtitle bar with a gray separator matching the title width.
pub fn print_subtitle_bar(title: &str) {
    println!("{}", title.white());
    let width = terminal_width(title);
    let separator: String = "─".repeat(width);
    println!("{}", separator.dimmed());
}

pub fn success(message: &str) {
    if message.is_empty() {
        println!("  {}", "✓".green());
    } else {
        println!("  {} {}", "✓".green(), message);
    }
}

pub fn warning(message: &str) {
    println!("  {} {}", "⚠".bold().yellow(), message);
}

pub fn info(message: &str) {
    println!("  • {message}");
}

pub fn error(message: &str) {
    eprintln!("  {} {}", "✗".bold().red(), message);
}

/// Create an orange-themed render config for `inquire` prompts.
pub fn create_orange_theme() -> inquire::ui::RenderConfig<'static> {
    inquire::ui::RenderConfig {
        prompt_prefix: inquire::ui::Styled::new("  ?").with_fg(crate::constants::ORANGE_RGB),
        answered_prompt_prefix: inquire::ui::Styled::new("  ✓").with_fg(crate::constants::ORANGE_RGB),
        answer: inquire::ui::StyleSheet::new().with_fg(crate::constants::ORANGE_RGB),
        ..Default::default()
    }
}

/// Run a command and return its output, logging argv and streams at debug level.
pub fn run_command(program: &str, args: &[&str]) -> Result<std::process::Output> {
    log::debug!("running: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to execute: {} {}", program, args.join(" ")))?;
    log::debug!("exit status: {}", output.status);
    if !output.stdout.is_empty() {
        log::debug!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    }
    if !output.stderr.is_empty() {
        log::debug!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(output)
}

pub fn command_exists(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

pub fn file_exists(path: &Path) -> bool {
    path.exists() && path.is_file()
}

pub fn dir_exists(path: &Path) -> bool {
    path.exists() && path.is_dir()
}

/// Formats a byte count the way the CLI's listings and summaries do:
/// binary-prefixed, one decimal place above KiB.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_formats_binary_units() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(1024 * 1024 * 1024), "1.0 GiB");
    }
}
