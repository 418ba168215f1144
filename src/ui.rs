//! Terminal feedback for the command-line tools.
//!
//! Pretty output uses indicatif spinners on a TTY; everything else gets plain
//! `==>` lines on stderr so logs stay greppable.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    #[default]
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        let pretty = is_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => std::env::var_os("NO_COLOR").is_none(),
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    /// Pick the mode for stderr as it is right now.
    pub fn for_stderr(mode: UiMode) -> Self {
        Self::new(mode, std::io::stderr().is_terminal())
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    /// Announce a stage; the guard reports its duration when dropped.
    /// Call `fail` on the guard to mark the stage as failed instead.
    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = if self.pretty {
            Some(spinner(format!("{name}…")))
        } else {
            eprintln!("==> {}", name);
            None
        };
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            failed: false,
        }
    }

    /// Long-running status line for the monitor loop.
    pub fn status(&self, initial: &str) -> StatusLine {
        if self.pretty {
            StatusLine {
                spinner: Some(spinner(initial.to_string())),
                last_plain: None,
            }
        } else {
            eprintln!("==> {}", initial);
            StatusLine {
                spinner: None,
                last_plain: Some(initial.to_string()),
            }
        }
    }
}

fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message);
    spinner
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl StageGuard {
    pub fn fail(mut self) {
        self.failed = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.failed { "✘" } else { "✔" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_duration(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub struct StatusLine {
    spinner: Option<ProgressBar>,
    last_plain: Option<String>,
}

impl StatusLine {
    /// Plain mode only prints when the message changes.
    pub fn update(&mut self, message: &str) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(message.to_string());
            return;
        }
        if self.last_plain.as_deref() != Some(message) {
            eprintln!("    {}", message);
            self.last_plain = Some(message.to_string());
        }
    }

    pub fn finish(self, message: &str) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => eprintln!("==> {}", message),
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 60 {
        let secs = duration.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_tty_is_never_pretty() {
        assert!(!Ui::new(UiMode::Pretty, false).is_pretty());
        assert!(!Ui::new(UiMode::Plain, true).is_pretty());
        assert!(Ui::new(UiMode::Pretty, true).is_pretty());
    }

    #[test]
    fn durations_scale_units() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }
}
