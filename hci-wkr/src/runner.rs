//! Realises a [`WorkerBehavior`]: product file, stdout trace, marker, exit code.

use anyhow::{Context, Result};
use hci_common::scenario::Outcome;
use hci_common::worker::{
    STOP_SENTINEL, TIMEOUT_HOLD, WorkerBehavior, WorkerContext, write_marker, write_product,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

/// Timing of the scripted steps.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Length of one step and of one sleep slice.
    pub step: Duration,
    /// Steps taken by quick passes and failures.
    pub quick_steps: u32,
    /// Upper bound of a hang.
    pub timeout_hold: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            quick_steps: 3,
            timeout_hold: TIMEOUT_HOLD,
        }
    }
}

pub struct Runner {
    ctx: WorkerContext,
    data_dir: PathBuf,
    pacing: Pacing,
}

impl Runner {
    pub fn new(ctx: WorkerContext, data_dir: impl Into<PathBuf>, pacing: Pacing) -> Self {
        Self {
            ctx,
            data_dir: data_dir.into(),
            pacing,
        }
    }

    fn sentinel(&self) -> PathBuf {
        self.data_dir.join(STOP_SENTINEL)
    }

    /// Run the behavior to completion and return the process exit code.
    pub async fn execute(&self, behavior: WorkerBehavior) -> Result<i32> {
        let product = self.ctx.product(behavior);
        let product_path = write_product(&self.data_dir, &product).with_context(|| {
            format!("Failed to write worker product into {}", self.data_dir.display())
        })?;
        info!(
            "Worker for {} {} will {:?} (product: {})",
            self.ctx.branch,
            self.ctx.commit8(),
            behavior,
            product_path.display()
        );
        println!(
            "hci-wkr: branch={} commit={} expected={}",
            self.ctx.branch,
            self.ctx.commit8(),
            behavior.outcome()
        );

        match behavior {
            WorkerBehavior::Pass => {
                self.quick_steps("pass").await;
                self.mark(Outcome::Success, "completed")?;
                println!("hci-wkr: SUCCESS");
                Ok(0)
            }
            WorkerBehavior::LongPass { hold } => {
                let stopped = self.hold(hold).await;
                let detail = if stopped { "stopped early" } else { "held slot" };
                self.mark(Outcome::Success, detail)?;
                println!("hci-wkr: SUCCESS after long hold");
                Ok(0)
            }
            WorkerBehavior::Fail => {
                self.quick_steps("fail").await;
                self.mark(Outcome::Failure, "scripted failure")?;
                println!("hci-wkr: ERROR scripted failure");
                eprintln!("hci-wkr: ERROR scripted failure");
                Ok(1)
            }
            WorkerBehavior::Hang => {
                // Marker first: the daemon is expected to kill us.
                self.mark(Outcome::Timeout, "hanging until killed")?;
                println!("hci-wkr: hanging for up to {:?}", self.pacing.timeout_hold);
                if self.hold(self.pacing.timeout_hold).await {
                    info!("Stop sentinel found; leaving hang early");
                } else {
                    warn!("Hang elapsed without being killed");
                }
                Ok(0)
            }
        }
    }

    async fn quick_steps(&self, label: &str) {
        for i in 1..=self.pacing.quick_steps {
            println!("hci-wkr: {label} step {i}/{}", self.pacing.quick_steps);
            sleep(self.pacing.step).await;
        }
    }

    /// Sleep up to `total` in step-sized slices. True if the sentinel ended it.
    async fn hold(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        let sentinel = self.sentinel();
        loop {
            if sentinel.exists() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.pacing.step.min(deadline - now)).await;
        }
    }

    fn mark(&self, outcome: Outcome, detail: &str) -> Result<()> {
        write_marker(
            &self.data_dir,
            &self.ctx.branch,
            self.ctx.commit8(),
            outcome,
            detail,
        )
        .with_context(|| format!("Failed to write {outcome} marker"))?;
        Ok(())
    }
}
