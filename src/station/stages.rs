//! Named, resumable protocol stages.
//!
//! Every resumable step of a protocol announces itself with
//! [`StageControl::stage`]. When the run is resumed with a `start_at` stage,
//! every stage before it reports that it must not run, and callers replay
//! only the volume bookkeeping for it.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// One entry of the stage history.
#[derive(Clone, Debug, PartialEq)]
pub struct StageRecord {
    /// Stage name
    pub name: String,
    /// When the stage was entered
    pub entered_at: DateTime<Utc>,
    /// Skipped because the run resumes from a later stage
    pub skipped: bool,
}

/// Stage progress of one run.
#[derive(Clone, Debug, Default)]
pub struct StageControl {
    start_at: Option<String>,
    reached: bool,
    history: Vec<StageRecord>,
}

impl StageControl {
    /// Control starting at `start_at`, or at the first stage when `None`.
    pub fn new(start_at: Option<String>) -> Self {
        if let Some(stage) = &start_at {
            info!("Run will resume from stage {}", stage);
        }
        Self {
            reached: start_at.is_none(),
            start_at,
            history: Vec::new(),
        }
    }

    /// Enter stage `name`. Returns whether it must be executed.
    pub fn stage(&mut self, name: &str) -> bool {
        if !self.reached && self.start_at.as_deref() == Some(name) {
            self.reached = true;
        }
        if self.reached {
            info!("Stage: {}", name);
        } else {
            info!("Skipping stage {}", name);
        }
        self.history.push(StageRecord {
            name: name.to_string(),
            entered_at: Utc::now(),
            skipped: !self.reached,
        });
        self.reached
    }

    /// Whether hardware actions are executed at this point of the run.
    pub fn is_running(&self) -> bool {
        self.reached
    }

    /// Name of the last stage entered
    pub fn current_stage(&self) -> Option<&str> {
        self.history.last().map(|r| r.name.as_str())
    }

    /// Every stage entered so far
    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Close the run, warning when the resume stage never came up.
    pub fn finish(&self) {
        match &self.start_at {
            Some(stage) if !self.reached => {
                warn!("Stage {} was never reached: nothing was executed", stage)
            }
            _ => info!("Run finished after {} stages", self.history.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_runs_everything_without_start_at() {
        let mut stages = StageControl::new(None);
        assert!(stages.is_running());
        assert!(stages.stage("Prepare EPH3"));
        assert!(stages.stage("Fill EPH3"));
        assert_eq!(stages.current_stage(), Some("Fill EPH3"));
        assert!(stages.history().iter().all(|r| !r.skipped));
    }

    #[test]
    fn test_skips_until_start_at() {
        let mut stages = StageControl::new(Some("EPH3 2/3".to_string()));
        assert!(!stages.is_running());
        assert!(!stages.stage("EPH3 1/3"));
        assert!(stages.stage("EPH3 2/3"));
        assert!(stages.stage("EPH3 3/3"));
        // once reached, a stage with the same name later on still runs
        assert!(stages.stage("EPH3 1/3"));

        let skipped: Vec<bool> = stages.history().iter().map(|r| r.skipped).collect();
        assert_eq!(skipped, vec![true, false, false, false]);
        assert!(stages.history()[0].entered_at <= stages.history()[1].entered_at);
    }

    #[test]
    #[traced_test]
    fn test_finish_warns_when_start_at_missing() {
        let mut stages = StageControl::new(Some("Nonexistent".to_string()));
        stages.stage("EPH3 1/1");
        stages.finish();
        assert!(logs_contain("was never reached"));
    }
}
