//! Test objects for the fastloader engine.
//!
//! Everything here runs on the host.  [`sim::SimBus`] stands in for the
//! serial bus and the computer at the other end of it, [`disk::MemDisk`]
//! for the mounted disk image and [`signals::ScriptedSignals`] for the
//! buttons.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod disk;
pub mod sim;
