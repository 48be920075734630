//! ## USB Session
//!
//! Process-wide libusb context shared by every open USB interface.
//!
//! The first interface that opens a device initializes the context, the last
//! one to close tears it down again.
//!

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use rusb::Context;
use tracing::debug;

use crate::error::Error;

/// ### Session Registry
///
/// Reference counted, lock protected holder of a lazily created value.
///
pub struct SessionRegistry<T> {
    state: Mutex<RegistryState<T>>,
}

struct RegistryState<T> {
    value: Option<T>,
    users: usize,
}

impl<T: Clone> SessionRegistry<T> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                value: None,
                users: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        // a panic while holding the lock leaves the counters consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// ### Acquire
    ///
    /// Return the shared value, creating it with `init` if there are no users yet.
    ///
    pub fn acquire(&self, init: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let value = match &state.value {
            Some(value) => value.clone(),
            None => {
                let value = init()?;
                state.value = Some(value.clone());
                value
            }
        };
        state.users += 1;
        Ok(value)
    }

    /// ### Release
    ///
    /// Drop one user. Returns true if it was the last one and the value was torn down.
    ///
    pub fn release(&self) -> bool {
        let mut state = self.lock();
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            state.value.take().is_some()
        } else {
            false
        }
    }

    /// Number of live users
    pub fn count(&self) -> usize {
        self.lock().users
    }
}

impl<T: Clone> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

static USB_SESSION: SessionRegistry<Context> = SessionRegistry::new();

/// ### USB Session
///
/// Guard holding one reference to the process-wide libusb context.
///
#[derive(Debug)]
pub struct UsbSession {
    context: Context,
}

impl UsbSession {
    pub fn acquire() -> Result<UsbSession> {
        let context = USB_SESSION.acquire(|| {
            let context = Context::new().map_err(Error::from)?;
            debug!("new libusb session initialized");
            Ok(context)
        })?;
        debug!(devices = USB_SESSION.count(), "acquired usb session");
        Ok(UsbSession { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Number of interfaces currently holding the session
    pub fn open_count() -> usize {
        USB_SESSION.count()
    }
}

impl Drop for UsbSession {
    fn drop(&mut self) {
        if USB_SESSION.release() {
            debug!("last usb device closed, libusb session released");
        }
    }
}
