use rpi_cloner_storage::{ProgressFrame, ProgressSink};

use crate::display::OperationDisplay;

/// Drives an [`OperationDisplay`] from the storage engines' [`ProgressSink`]
/// frames: the last line becomes the bar's message, the ratio (when
/// present) becomes its fill.
pub struct TerminalProgressSink<'a> {
    display: &'a OperationDisplay,
}

impl<'a> TerminalProgressSink<'a> {
    pub fn new(display: &'a OperationDisplay) -> Self {
        Self { display }
    }
}

impl ProgressSink for TerminalProgressSink<'_> {
    fn emit(&mut self, frame: ProgressFrame) {
        if let Some(line) = frame.lines.last() {
            self.display.set_message(line.clone());
        }
        if let Some(ratio) = frame.ratio {
            self.display.set_ratio(ratio);
        }
    }
}
