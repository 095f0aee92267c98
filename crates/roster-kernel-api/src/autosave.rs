use std::time::Duration;

use anyhow::{Context, Result};
use roster_kernel_store_file::SaveReport;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::Registry;

/// Default period between background saves.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(600);

const MIN_AUTOSAVE_INTERVAL: Duration = Duration::from_millis(10);

/// Background task that saves the roster every period and once more when it
/// stops.
///
/// Dropping the handle stops the loop as well; the final save still runs, but
/// its outcome is only visible through [`Autosave::shutdown`].
#[derive(Debug)]
pub struct Autosave {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<SaveReport>>,
}

impl Autosave {
    /// Start saving `registry` every `period`. The first save happens one full
    /// period after the call; ticks missed while a save runs are delayed, not
    /// bursted.
    #[must_use]
    pub fn spawn(registry: Registry, period: Duration) -> Self {
        let period = period.max(MIN_AUTOSAVE_INTERVAL);
        let (stop, mut stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(roster_id = %registry.roster_id(), period_ms = period.as_millis(), "autosave started");

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => match registry.flush().await {
                        Ok(report) => debug!(students = report.students, "autosaved roster"),
                        Err(err) => warn!(error = %format!("{err:#}"), "autosave failed; retrying on next tick"),
                    },
                }
            }

            let report = registry.flush().await.context("final roster save failed")?;
            info!(students = report.students, path = %report.path.display(), "autosave stopped after final save");
            Ok(report)
        });

        Self { stop, handle }
    }

    /// Stop the loop and wait for the final save.
    ///
    /// # Errors
    /// Returns an error when the final save fails or the task panicked.
    pub async fn shutdown(self) -> Result<SaveReport> {
        let Self { stop, handle } = self;
        // The task may already be gone if it panicked; the join below reports it.
        let _ = stop.send(());
        handle.await.context("autosave task did not complete")?
    }
}
