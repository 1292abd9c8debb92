//! Terminal output for the `run` command: spinner and coloured results.
//!
//! Uses `indicatif` for the progress spinner and `console` for styling.
//! [`JobProgress`] follows one job as it moves through its steps.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{JobState, JobStatus, JobSummary, Step};

pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    printed: usize,
}

impl JobProgress {
    /// Start the spinner for `job_id`.
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{job_id}: starting"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            printed: 0,
        }
    }

    /// Refresh the spinner from a state snapshot. Each step that finished
    /// since the last call gets its own line.
    pub fn update(&mut self, job: &JobState) {
        let completed = job.completed_steps();
        for step in completed.iter().skip(self.printed) {
            self.pb.println(format!("  {} {step}", self.green.apply_to("✓")));
        }
        self.printed = completed.len();

        if let Some(step) = job.current_step {
            let n = step.position() + 1;
            let total = Step::ALL.len();
            self.pb.set_message(format!("[{n}/{total}] {step}"));
        }
    }

    /// Stop the spinner and print the final outcome.
    pub fn finish(&self, job: &JobState) {
        self.pb.finish_and_clear();
        match job.status {
            JobStatus::Completed => {
                println!("  {} Job {} completed", self.green.apply_to("✓"), job.job_id);
            }
            JobStatus::Failed => {
                println!(
                    "  {} Job {} failed: {}",
                    self.red.apply_to("✗"),
                    job.job_id,
                    job.error.as_deref().unwrap_or("unknown error")
                );
            }
            other => {
                println!("  {} Job {} is {other}", self.yellow.apply_to("…"), job.job_id);
            }
        }
    }

    /// Print the job summary as coloured JSON.
    pub fn print_summary(&self, summary: &JobSummary) {
        let status_style = match summary.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Job Summary ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }
}
