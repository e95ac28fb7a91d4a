//! Terminal feedback for `roost create`.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::handlers::CreateReply;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg} [{bar:30.cyan/blue}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Spinner while the daemon works, switching to a download bar once the
/// first progress reply arrives. Draws nothing when stderr is not a terminal.
pub struct CreateProgress {
    bar: ProgressBar,
    downloading: bool,
    complete: Option<String>,
}

impl CreateProgress {
    pub fn start(image: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if !std::io::stderr().is_terminal() {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(spinner_style());
        let image = if image.is_empty() { "default image" } else { image };
        bar.set_message(format!("Creating instance from {image}"));
        bar.enable_steady_tick(Duration::from_millis(80));
        Self {
            bar,
            downloading: false,
            complete: None,
        }
    }

    pub fn update(&mut self, reply: &CreateReply) {
        match reply {
            CreateReply::DownloadProgress(percent) => {
                if !self.downloading {
                    self.downloading = true;
                    self.bar.disable_steady_tick();
                    self.bar.set_style(download_style());
                    self.bar.set_length(100);
                    self.bar.set_message("Retrieving image");
                }
                self.bar.set_position((*percent).clamp(0, 100) as u64);
                if *percent >= 100 {
                    self.bar.set_style(spinner_style());
                    self.bar.set_message("Starting instance");
                    self.bar.enable_steady_tick(Duration::from_millis(80));
                    self.downloading = false;
                }
            }
            CreateReply::CreateComplete(msg) => self.complete = Some(msg.clone()),
            CreateReply::InstanceName(_) => {}
        }
    }

    /// Clears the display; returns the completion message, if one came.
    pub fn finish(self) -> Option<String> {
        self.bar.finish_and_clear();
        self.complete
    }

    pub fn fail(self) {
        self.bar.finish_and_clear();
    }
}
