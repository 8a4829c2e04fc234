//! An in-memory transport for tests and demos
//!
//! [`FakeTransport`] records every command it's given and, for any
//! [`FakeDevice`]s that have been added, answers those commands the way a
//! well-behaved radio stack would. [`ManualScheduler`] lets tests decide
//! exactly when operation timers expire.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::trace;

use crate::transport::{Scheduler, TransportEvent};
use crate::{Handle, OpToken};

mod device;
pub use device::{FakeCharacteristic, FakeDescriptor, FakeDevice, FakeService};

mod transport;
pub use transport::{Command, FakeTransport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timer {
    pub handle: Handle,
    pub token: OpToken,
    pub after: Duration,
}

/// A [`Scheduler`] whose timers only expire when told to
#[derive(Clone, Debug, Default)]
pub struct ManualScheduler {
    timers: Arc<Mutex<Vec<Timer>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers that have been armed and not yet cancelled or expired
    pub fn live(&self) -> Vec<Timer> {
        lock(&self.timers).clone()
    }

    /// Expires the oldest live timer for `handle`, returning the timeout
    /// event that should be fed to the engine
    pub fn expire(&self, handle: Handle) -> Option<TransportEvent> {
        let mut timers = lock(&self.timers);
        let i = timers.iter().position(|timer| timer.handle == handle)?;
        let timer = timers.remove(i);
        Some(TransportEvent::Timeout {
            handle: timer.handle,
            token: timer.token,
        })
    }

    pub fn expire_all(&self) -> Vec<TransportEvent> {
        lock(&self.timers)
            .drain(..)
            .map(|timer| TransportEvent::Timeout {
                handle: timer.handle,
                token: timer.token,
            })
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn arm(&self, handle: Handle, token: OpToken, after: Duration) {
        trace!("Arming {:?} for {} ({:?})", token, handle, after);
        lock(&self.timers).push(Timer { handle, token, after });
    }

    fn cancel(&self, token: OpToken) {
        lock(&self.timers).retain(|timer| timer.token != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_timers_never_expire() {
        let scheduler = ManualScheduler::new();
        scheduler.arm(Handle(1), OpToken(0), Duration::from_secs(1));
        scheduler.arm(Handle(2), OpToken(1), Duration::from_secs(1));
        scheduler.cancel(OpToken(0));

        assert_eq!(scheduler.expire(Handle(1)), None);
        assert_eq!(
            scheduler.expire(Handle(2)),
            Some(TransportEvent::Timeout {
                handle: Handle(2),
                token: OpToken(1)
            })
        );
        assert!(scheduler.live().is_empty());
    }
}
