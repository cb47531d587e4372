/// Trait for receiving export progress updates.
///
/// All methods take `&self` (not `&mut self`) so the reporter can be handed
/// to a background task and observed from elsewhere.
pub trait ExportProgress: Send + Sync {
    /// Overall progress: a percentage in `0..=100` plus a short message.
    ///
    /// The percentage stays below 100 until the project file has been
    /// written; the final call is always `(100, _)`.
    fn progress(&self, _percent: u8, _message: &str) {}

    /// Called when a meta entry is skipped (e.g. it cannot be decrypted).
    fn entry_skipped(&self, _name: &str, _reason: &str) {}
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl ExportProgress for SilentProgress {}

/// Console progress reporter using an indicatif progress bar.
///
/// The bar tracks the overall percentage and redraws at a fixed rate,
/// avoiding per-file stdout churn on large packages.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        let bar = indicatif::ProgressBar::new(100).with_style(
            indicatif::ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos:>3}% {msg}")
                .unwrap()
                .progress_chars("━╸─"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());

        Self { bar }
    }

    /// Finishes the bar, leaving the terminal clean.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ExportProgress for ConsoleProgress {
    fn progress(&self, percent: u8, message: &str) {
        self.bar.set_position(percent.into());
        self.bar.set_message(message.to_string());
    }

    fn entry_skipped(&self, name: &str, reason: &str) {
        self.bar.println(format!("skipped {name}: {reason}"));
    }
}
