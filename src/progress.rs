//! Terminal progress for runs

use colored::Colorize;
use declarative::{Outcome, Phase, RunObserver};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Progress bar that prints one line per finished resource
pub struct ProgressObserver {
    bar: ProgressBar,
    verb: &'static str,
}

impl ProgressObserver {
    /// `verb` is shown while the run is in flight, e.g. "Applying"
    pub fn new(verb: &'static str, quiet: bool) -> Self {
        let bar = ProgressBar::new(0);
        if quiet {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        match ProgressStyle::default_bar().template(TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("=>-")),
            Err(e) => log::debug!("Invalid progress template: {e}"),
        }
        Self { bar, verb }
    }
}

impl RunObserver for ProgressObserver {
    fn on_run_start(&mut self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_message(self.verb);
    }

    fn on_resource_start(&mut self, id: &str, phase: Phase) {
        log::debug!("{phase} {id}");
        self.bar.set_message(format!("{} {id}", self.verb));
    }

    fn on_resource_complete(&mut self, id: &str, outcome: &Outcome) {
        if !self.bar.is_hidden() {
            self.bar.println(outcome_line(id, outcome));
        }
        self.bar.inc(1);
    }

    fn on_run_complete(&mut self) {
        self.bar.finish_and_clear();
    }
}

/// One status line, e.g. `  ✓ readme created`
pub fn outcome_line(id: &str, outcome: &Outcome) -> String {
    let symbol = match outcome {
        Outcome::Created | Outcome::Updated | Outcome::Deleted => "✓".green(),
        Outcome::Noop => "○".dimmed(),
        Outcome::Failed(_) => "✗".red(),
        Outcome::Skipped(_) => "⊘".yellow(),
    };
    let detail = match outcome {
        Outcome::Failed(_) | Outcome::Skipped(_) => outcome.to_string().dimmed().to_string(),
        _ => outcome.to_string(),
    };
    format!("  {symbol} {id:<30} {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::SkipReason;

    #[test]
    fn test_outcome_line() {
        colored::control::set_override(false);
        assert_eq!(
            outcome_line("readme", &Outcome::Created),
            format!("  ✓ {:<30} created", "readme")
        );
        let skipped = Outcome::Skipped(SkipReason::Blocked { by: "logs".into() });
        assert!(outcome_line("readme", &skipped).ends_with("skipped: blocked by 'logs'"));
    }

    #[test]
    fn test_quiet_observer_counts() {
        let mut observer = ProgressObserver::new("Applying", true);
        observer.on_run_start(2);
        observer.on_resource_start("a", Phase::Create);
        observer.on_resource_complete("a", &Outcome::Created);
        assert_eq!(observer.bar.position(), 1);
        observer.on_run_complete();
        assert!(observer.bar.is_finished());
    }
}
