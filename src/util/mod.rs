//! Various utils for the fastloader engine.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod built;
pub mod crc;
pub mod time;
