use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::ORANGE_256;
use crate::utils::print_title_bar;

/// Wraps a ratio-driven progress bar for a single long-running operation
/// (clone, erase, format, restore). Prints the operation's title once, then
/// stays at the bottom of the terminal for the duration of the run.
pub struct OperationDisplay {
    pb: ProgressBar,
}

impl OperationDisplay {
    pub fn new(title: &str) -> Self {
        print_title_bar(title);
        println!();

        let pb = ProgressBar::new(100);
        let template =
            format!("{{spinner:.{ORANGE_256}}} {{msg}} [{{bar:28.{ORANGE_256}}}] {{percent}}%");
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&template)
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", " "])
                .progress_chars("█░ "),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(80));

        Self { pb }
    }

    pub fn set_message(&self, message: String) {
        self.pb.set_message(message);
    }

    pub fn set_ratio(&self, ratio: f64) {
        self.pb.set_position((ratio.clamp(0.0, 1.0) * 100.0).round() as u64);
    }

    pub fn suspend_for_prompt<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.pb.suspend(f)
    }

    pub fn finish(&self, message: &str) {
        self.pb.finish_with_message(message.to_string());
    }
}
