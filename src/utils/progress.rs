/// Terminal progress for long-running steps
///
/// Spinners are drawn on stderr only when it is a terminal; under cron or in
/// tests the bar is hidden and nothing is printed.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct Step {
    bar: ProgressBar,
    label: String,
}

impl Step {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(label.clone());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar, label }
    }

    pub fn done(self) {
        self.bar
            .finish_with_message(format!("{} {}", "✓".green(), self.label));
    }

    pub fn fail(self) {
        self.bar
            .finish_with_message(format!("{} {}", "✗".red(), self.label));
    }
}
