use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use log::{info, warn};

use crate::{engine::DnsOverrideEngine, logging};

pub type SharedEngine = Arc<Mutex<DnsOverrideEngine>>;

/// Lock the engine, tolerating a poisoned mutex.
///
/// A panic while holding the lock leaves the on-disk records intact, so the
/// next caller can carry on from them.
pub fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, DnsOverrideEngine> {
    match engine.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            warn!("engine mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

/// Restore every client, then restart dead resolvers every `tick` until
/// `stop` is set. Resolvers are left running on exit.
pub fn watch(engine: &SharedEngine, tick: Duration, stop: &AtomicBool) {
    let failed = lock_engine(engine).restore_all();
    for (id, e) in &failed {
        logging::activity_warn(&format!("restore {id}: {e}"));
    }
    info!("watching clients every {} ms", tick.as_millis());

    while !stop.load(Ordering::Relaxed) {
        sleep_unless_stopped(tick, stop);
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let healed = lock_engine(engine).heal();
        if healed > 0 {
            info!("heal: {healed} resolver(s) restarted");
        }
    }
    info!("watch stopped");
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(100).min(total);
    let mut slept = Duration::ZERO;
    while slept < total && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        slept += step;
    }
}
