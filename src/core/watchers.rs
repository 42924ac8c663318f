//! Polls the job-dispatch provider for runner busy-state transitions. See
//! spec §4.4.

use std::thread;
use std::time::Duration;

use crate::core::github::TokenSource;
use crate::utils::{log, warn};

const CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Runs forever until it observes the remote runner in `busy` state, then
/// invokes `on_busy` exactly once and exits. A missing-or-error response is
/// swallowed as transient; the watcher retries on the next tick.
pub struct RunnerWatcher;

impl RunnerWatcher {
    pub fn start<T, F>(token_source: std::sync::Arc<T>, runner_id: i64, mut on_busy: F)
    where
        T: TokenSource + Send + Sync + 'static,
        F: FnMut() + Send + 'static,
    {
        thread::Builder::new()
            .name("runner-watcher".to_string())
            .spawn(move || {
                log("started polling to detect when the runner started working");
                loop {
                    match token_source.get_runner(runner_id) {
                        Ok(status) if status.busy => {
                            log("the runner started processing a build!");
                            on_busy();
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => warn(format!("transient error polling runner status: {err}")),
                    }
                    thread::sleep(CHECK_INTERVAL);
                }
            })
            .expect("failed to spawn runner watcher thread");
    }
}
