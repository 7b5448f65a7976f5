//! Infrastructure modules connecting the fastloader engine to the hardware
//! and the rest of the firmware.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod gpio;
pub mod ui;
