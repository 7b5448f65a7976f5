//! This module contains compile-time configuration for the fastloader
//! engine.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use static_assertions::const_assert;

//
// Buffers
//

/// Size of a disk sector, and of every transfer buffer.
pub const SECTOR_SIZE: usize = 256;

/// Number of general purpose sector buffers in the pool.  The system buffer
/// is in addition to these.  Spindle 3 needs one for the current sector and
/// one for a postponed sector.
pub const NUM_BUFFERS: usize = 3;
const_assert!(NUM_BUFFERS >= 2);
const_assert!(NUM_BUFFERS <= 8);

//
// Disk layout
//

/// Directory track of 1541 style images.
pub const DIR_TRACK: u8 = 18;

/// First directory sector of 1541 style images.
pub const DIR_START_SECTOR: u8 = 1;

/// Highest track number a 1541 style image can have (extended 40 track
/// images).
pub const MAX_TRACK: u8 = 40;

/// Highest track number of a standard 35 track image.
pub const STD_TRACKS: u8 = 35;

/// Length of a file name in a directory entry.
pub const CBM_NAME_LENGTH: usize = 16;

/// Byte used to pad file names in directory entries.
pub const NAME_PAD: u8 = 0xa0;

/// File type bits of a directory entry's type byte.
pub const FILE_TYPE_MASK: u8 = 0x07;

/// PRG, in the file type bits.
pub const FILE_TYPE_PRG: u8 = 0x02;

/// Size of a directory entry in a 1541 directory sector.
pub const DIR_ENTRY_SIZE: usize = 32;
const_assert!(DIR_ENTRY_SIZE * 8 == SECTOR_SIZE);

//
// UI
//

/// Key presses queued for a running loader.  Presses beyond this are
/// dropped.
pub const KEY_QUEUE_SIZE: usize = 4;

//
// Commands
//

/// M-W location of the device address, 1541 style.
pub const DEVICE_ADDRESS_MW: u16 = 119;

/// VIA locations which drive detection code writes to: the VIA 2 timer,
/// which sets the IRQ frequency, and VIA 1 DDRB, written by N0SD0S.  M-W to
/// these are never drivecode.
pub const IGNORED_MW_ADDRESSES: [u16; 3] = [0x1c06, 0x1c07, 0x1802];

/// Address that M-R reads for the drive check answer.
pub const CUSTOM_MAGIC_ADDRESS: u16 = 0x300;

/// Value M-R returns for the drive check answer.  The first read returned
/// '0', from "00, OK".
pub const CUSTOM_MAGIC_VALUE: [u8; 2] = [!b'0', 0];
