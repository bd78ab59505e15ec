//! Background commit activity on the test repository.

use crate::repo::TestRepo;
use hci_common::fixtures::activity_step;
use hci_common::types::short_commit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub struct ActivitySimulator {
    repo: Arc<TestRepo>,
    tick: u64,
}

impl ActivitySimulator {
    pub fn new(repo: Arc<TestRepo>) -> Self {
        Self { repo, tick: 0 }
    }

    /// Commit once per `period` until `shutdown` turns true or
    /// `max_commits` commits have been made. Returns the number made.
    pub async fn run(
        mut self,
        period: Duration,
        max_commits: Option<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the seed commits already cover it.
        ticker.tick().await;
        info!("Activity simulator started (interval: {:?})", period);

        let mut made = 0u64;
        loop {
            if *shutdown.borrow() || max_commits.is_some_and(|max| made >= max) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if self.step().await {
                        made += 1;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Activity simulator stopped after {} commits", made);
        made
    }

    /// One commit on the next branch of the rotation. False if it failed.
    async fn step(&mut self) -> bool {
        let n = self.tick;
        self.tick += 1;
        let Some((branch, message)) = activity_step(self.repo.topology(), n) else {
            return false;
        };
        let branch = branch.to_string();

        let repo = self.repo.clone();
        let task_branch = branch.clone();
        let outcome =
            tokio::task::spawn_blocking(move || repo.commit(&task_branch, message)).await;
        match outcome {
            Ok(Ok(hash)) => {
                debug!("Committed {} on {}: {}", short_commit(&hash), branch, message);
                true
            }
            Ok(Err(e)) => {
                warn!("Commit on {} failed: {}", branch, e);
                false
            }
            Err(e) => {
                warn!("Commit task for {} failed: {}", branch, e);
                false
            }
        }
    }
}
