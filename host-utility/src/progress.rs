// Spinner helper for short, indeterminate checks (dependency verification,
// peer discovery browse windows) that don't have a byte-driven ratio.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::constants::ORANGE_256;

/// Creates an orange-themed spinner with a message. Auto-ticks every 80ms;
/// call `.finish_and_clear()` when done.
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let template = format!("  {{spinner:.{ORANGE_256}}} {message}");
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template(&template)
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}
