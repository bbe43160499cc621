//! Application UI: a progress bar over pages, a spinner while we look for
//! the table of plates, and a stderr writer that keeps logs from tearing them.
//!
//! The writer is adapted from `substudy` by Eric Kidd, which is licensed
//! under Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};

/// How often bars redraw on their own, so long pages still show a ticking
/// clock.
const TICK: Duration = Duration::from_millis(250);

/// Application UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    bars: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            bars: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that never draws.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Ui {
            bars: Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden())),
        }
    }

    /// Stop drawing bars, for `--quiet` runs. Logs still go to stderr.
    pub fn hide_progress_bars(&self) {
        self.bars.set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A `tracing` writer that suspends the bars while it writes.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// A bar counting `len` pages.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        self.add(ProgressBar::new(len).with_style(page_style()), config)
    }

    /// A spinner for work of unknown length.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        self.add(ProgressBar::new_spinner().with_style(spinner_style()), config)
    }

    fn add(&self, bar: ProgressBar, config: &ProgressConfig<'_>) -> ProgressBar {
        let bar = self.bars.add(bar);
        #[cfg(test)]
        bar.set_draw_target(ProgressDrawTarget::hidden());
        bar.set_prefix(config.emoji.to_owned());
        bar.set_message(config.msg.to_owned());
        bar.enable_steady_tick(TICK);
        bar.with_finish(ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }

    /// Run `f` with every bar cleared from the terminal.
    fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.bars.suspend(f)
    }
}

/// Labels for a progress bar or spinner.
pub struct ProgressConfig<'a> {
    pub emoji: &'a str,
    /// Shown while running.
    pub msg: &'a str,
    /// Shown once the bar is dropped.
    pub done_msg: &'a str,
}

fn page_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "  {prefix:3}{msg:25} {pos:>4}/{len:4} pages {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}",
        )
        .expect("bad progress bar template")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg}")
        .expect("bad progress bar template")
}

/// Writes to `stderr` without tearing the progress bars.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.suspend(|| io::stderr().flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn page_bar_counts_and_writer_passes_through() {
        let ui = Ui::init_for_tests();
        let config = ProgressConfig {
            emoji: "",
            msg: "Working",
            done_msg: "Done",
        };
        let bar = ui.new_progress_bar(&config, 3);
        bar.inc(3);
        assert_eq!(bar.position(), 3);
        assert_eq!(bar.message(), "Working");

        let mut writer = ui.get_stderr_writer();
        writer.write_all(b"").unwrap();
        writer.flush().unwrap();
    }
}
