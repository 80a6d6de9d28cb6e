use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex, MutexGuard, PoisonError,
};

use tracing::{debug, info, trace};

use super::PresentError;
use crate::hw::{DisplayHandle, Hardware};

/// Device-wide presentation state.
///
/// Owns the open display and the single outstanding-flip slot shared by every
/// surface on it. The hardware accepts one in-flight flip per device, so
/// `pending` is always 0 or 1. Every blocking operation in the core waits on
/// `flipped` with its own predicate.
pub struct Device {
    hw: Arc<dyn Hardware>,
    display: DisplayHandle,
    width: u32,
    height: u32,
    pending: Mutex<u32>,
    flipped: Condvar,
    sequence: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("display", &self.display)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pending", &self.pending_flips())
            .finish()
    }
}

impl Device {
    /// Opens display `id`. A non-zero `size_override` replaces the size the
    /// provider reports, which some firmware leaves at zero.
    pub fn open(
        hw: Arc<dyn Hardware>,
        id: u32,
        size_override: (u32, u32),
    ) -> Result<Arc<Self>, PresentError> {
        let display = hw.open(id)?;

        let (mut width, mut height) = size_override;
        if width == 0 || height == 0 {
            match hw.size(display) {
                Ok(size) => (width, height) = size,
                Err(err) => {
                    hw.close(display);
                    return Err(err.into());
                }
            }
        }
        if width == 0 || height == 0 {
            hw.close(display);
            return Err(PresentError::ZeroDimension);
        }

        info!("Opened display {} ({}x{})", id, width, height);
        Ok(Arc::new(Self {
            hw,
            display,
            width,
            height,
            pending: Mutex::new(0),
            flipped: Condvar::new(),
            sequence: AtomicU64::new(0),
        }))
    }

    pub fn hardware(&self) -> &dyn Hardware {
        self.hw.as_ref()
    }

    pub fn display(&self) -> DisplayHandle {
        self.display
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Flips submitted but not yet confirmed visible.
    pub fn pending_flips(&self) -> u32 {
        *self.lock_pending()
    }

    fn lock_pending(&self) -> MutexGuard<'_, u32> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until no flip is outstanding on this device.
    pub fn wait_idle(&self) {
        let mut pending = self.lock_pending();
        while *pending > 0 {
            trace!("waiting for {} outstanding flip(s) to retire", *pending);
            pending = self
                .flipped
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits for the flip slot to be free, then claims it if `admit` yields
    /// a value.
    ///
    /// `admit` runs with the slot observed empty and the device lock held, so
    /// nothing can be in flight while it inspects or claims page state.
    pub(crate) fn reserve_flip<T>(&self, admit: impl FnOnce() -> Option<T>) -> Option<T> {
        let mut pending = self.lock_pending();
        while *pending > 0 {
            pending = self
                .flipped
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let admitted = admit()?;
        *pending += 1;
        Some(admitted)
    }

    /// Retires the outstanding flip and wakes every waiter. Must be the last
    /// step of completion so woken threads see the reclaimed page.
    pub(crate) fn finish_flip(&self) {
        let mut pending = self.lock_pending();
        *pending = pending.saturating_sub(1);
        self.flipped.notify_all();
    }

    /// Runs `poll` under the device lock until it yields a value, sleeping on
    /// the flip condition between attempts. Wakeups carry no meaning on their
    /// own; `poll` decides.
    pub(crate) fn wait_for<T>(&self, mut poll: impl FnMut() -> Option<T>) -> T {
        let mut pending = self.lock_pending();
        loop {
            if let Some(value) = poll() {
                return value;
            }
            pending = self
                .flipped
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!("Closing display {:?}", self.display);
        self.hw.close(self.display);
    }
}
