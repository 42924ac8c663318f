use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

/// Prints a timestamped log line, using the `==> message` convention this
/// executor uses throughout.
pub fn log(message: impl AsRef<str>) {
    let now = OffsetDateTime::now_utc();
    let stamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string());
    println!("==> [{stamp}] {}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    let now = OffsetDateTime::now_utc();
    let stamp = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string());
    eprintln!("==> [{stamp}] warning: {}", message.as_ref());
}

/// A fire-once timer. Runs its callback on a detached worker thread after the
/// given timeout, looping on the sleep to survive spurious wakeups.
pub struct Timer;

impl Timer {
    /// Spawns a detached thread that invokes `callback` exactly once after
    /// `timeout` has elapsed, measured from the moment `start` is called.
    pub fn start<F>(name: &'static str, timeout: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let started_at = Instant::now();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log(format!(
                    "started timer {name}, fires in {} seconds",
                    timeout.as_secs()
                ));

                loop {
                    let elapsed = started_at.elapsed();
                    if elapsed >= timeout {
                        break;
                    }
                    thread::sleep(timeout - elapsed);
                }

                log(format!("timer {name} fired"));
                callback();
            })
            .expect("failed to spawn timer thread");
    }
}

/// A single-writer flag that can be read from other threads without locking
/// on every read's happy path — the same single-writer invariant the
/// credential server and the VM's `prevent_external_shutdowns` flag rely on.
pub struct StickyFlag(Mutex<bool>);

impl StickyFlag {
    pub fn new() -> Self {
        Self(Mutex::new(false))
    }

    pub fn set(&self) {
        let mut guard = self.0.lock().expect("sticky flag poisoned");
        *guard = true;
    }

    pub fn get(&self) -> bool {
        *self.0.lock().expect("sticky flag poisoned")
    }
}

impl Default for StickyFlag {
    fn default() -> Self {
        Self::new()
    }
}
