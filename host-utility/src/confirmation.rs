use anyhow::Result;
use colored::Colorize;
use inquire::{ui::RenderConfig, ui::Styled, Confirm};

use crate::constants::ORANGE_RGB;
use crate::utils::print_subtitle_bar;

/// A destructive action the user is about to authorize (clone, erase,
/// format, restore), described in plain language for the confirmation
/// prompt.
pub struct DestructiveAction {
    pub headline: String,
    pub details: Vec<String>,
}

#[derive(Clone)]
pub struct ConfirmationConfig {
    pub auto_confirm: bool,
    pub verbose: bool,
}

pub enum ConfirmationResult {
    Confirmed,
    Cancelled,
}

/// Prompts the operator to confirm a destructive action, unless
/// `auto_confirm` is set (the CLI's `--yes` flag).
pub fn confirm_destructive_action(
    action: &DestructiveAction,
    config: &ConfirmationConfig,
) -> ConfirmationResult {
    if config.auto_confirm {
        if config.verbose {
            println!();
            display_details(action);
            println!("{} {}", "✓".green(), "Auto-confirmed".dimmed());
        }
        return ConfirmationResult::Confirmed;
    }

    println!();
    print_subtitle_bar(&action.headline);
    display_details(action);
    println!();

    let render_config = RenderConfig {
        prompt_prefix: Styled::new("?").with_fg(ORANGE_RGB),
        answer: inquire::ui::StyleSheet::new().with_fg(ORANGE_RGB),
        help_message: inquire::ui::StyleSheet::new().with_fg(ORANGE_RGB),
        ..Default::default()
    };

    let confirm = Confirm::new("Proceed?")
        .with_default(false)
        .with_help_message("this cannot be undone")
        .with_render_config(render_config)
        .prompt();

    match confirm {
        Ok(true) => ConfirmationResult::Confirmed,
        Ok(false) | Err(_) => ConfirmationResult::Cancelled,
    }
}

fn display_details(action: &DestructiveAction) {
    for detail in &action.details {
        println!("  • {detail}");
    }
}

pub fn is_non_interactive() -> bool {
    use std::io::IsTerminal;
    !std::io::stdin().is_terminal()
}

/// Fails fast in non-interactive environments unless the caller already
/// passed `--yes`.
pub fn validate_environment(config: &ConfirmationConfig) -> Result<()> {
    if !config.auto_confirm && is_non_interactive() {
        anyhow::bail!(
            "running in a non-interactive environment (no TTY detected); pass --yes to confirm"
        );
    }
    Ok(())
}
