//! Plumbing between the user interface and running loaders.
//!
//! Button handling and the disk image layer run as their own tasks, possibly
//! on the other core.  They talk to a loader through [`UI`]: key presses
//! are queued, image changes are signalled, and the loader's disk change
//! requests are signalled back.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use crate::constants::KEY_QUEUE_SIZE;
use crate::driver::{DriveSignals, Key};
#[allow(unused_imports)]
use crate::fmt::{debug, error, info, trace, warn};

/// The firmware wide UI plumbing.  We use `CriticalSectionRawMutex` as the
/// button and image tasks may run on a different core to the loader.
pub static UI: Ui = Ui::new();

pub struct Ui {
    keys: Channel<CriticalSectionRawMutex, Key, KEY_QUEUE_SIZE>,
    dir_changed: Signal<CriticalSectionRawMutex, ()>,
    disk_change: Signal<CriticalSectionRawMutex, Key>,
}

impl Default for Ui {
    fn default() -> Self {
        Self::new()
    }
}

impl Ui {
    pub const fn new() -> Self {
        Self {
            keys: Channel::new(),
            dir_changed: Signal::new(),
            disk_change: Signal::new(),
        }
    }

    /// Called by the button task.
    pub fn press(&self, key: Key) {
        if self.keys.try_send(key).is_err() {
            warn!("Key queue full, dropped {}", key);
        }
    }

    /// Called by the image layer once a new image is mounted.
    pub fn image_changed(&self) {
        self.dir_changed.signal(());
    }

    /// Wait for a loader to ask for a disk change.
    pub async fn disk_change_request(&self) -> Key {
        self.disk_change.wait().await
    }

    /// Discard anything left over, for example before a new session.
    pub fn clear(&self) {
        self.keys.clear();
        self.dir_changed.reset();
        self.disk_change.reset();
    }

    /// A [`DriveSignals`] handle for a loader session.
    pub fn signals(&self) -> UiSignals<'_> {
        UiSignals(self)
    }
}

/// The loader's view of [`Ui`].
pub struct UiSignals<'a>(&'a Ui);

impl DriveSignals for UiSignals<'_> {
    fn take_dir_changed(&mut self) -> bool {
        self.0.dir_changed.try_take().is_some()
    }

    fn take_key(&mut self) -> Option<Key> {
        self.0.keys.try_receive().ok()
    }

    fn change_disk(&mut self, key: Key) {
        self.0.disk_change.signal(key);
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;

    #[test]
    fn keys_are_queued_in_order() {
        let ui = Ui::new();
        ui.press(Key::Next);
        ui.press(Key::Sleep);
        let mut signals = ui.signals();
        assert_eq!(signals.take_key(), Some(Key::Next));
        assert_eq!(signals.take_key(), Some(Key::Sleep));
        assert_eq!(signals.take_key(), None);
    }

    #[test]
    fn full_queue_drops_presses() {
        let ui = Ui::new();
        for _ in 0..KEY_QUEUE_SIZE + 2 {
            ui.press(Key::Prev);
        }
        let mut signals = ui.signals();
        let mut count = 0;
        while signals.take_key().is_some() {
            count += 1;
        }
        assert_eq!(count, KEY_QUEUE_SIZE);
    }

    #[test]
    fn image_change_is_taken_once() {
        let ui = Ui::new();
        let mut signals = ui.signals();
        assert!(!signals.take_dir_changed());
        ui.image_changed();
        assert!(signals.take_dir_changed());
        assert!(!signals.take_dir_changed());
    }

    #[test]
    fn disk_change_requests_reach_the_image_layer() {
        let ui = Ui::new();
        ui.signals().change_disk(Key::Home);
        assert_eq!(block_on(ui.disk_change_request()), Key::Home);

        ui.signals().change_disk(Key::Next);
        ui.clear();
        ui.press(Key::Prev);
        ui.clear();
        assert_eq!(ui.signals().take_key(), None);
    }
}
