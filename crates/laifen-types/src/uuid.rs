//! Bluetooth UUIDs for Laifen toothbrushes.
//!
//! The toothbrush exposes a single vendor service with one characteristic
//! that is used for reads, writes and notifications alike.

use uuid::{Uuid, uuid};

/// Laifen vendor service UUID.
pub const LAIFEN_SERVICE: Uuid = uuid!("0000ff01-0000-1000-8000-00805f9b34fb");

/// Data characteristic: readable, writable and notifying.
pub const DATA_CHARACTERISTIC: Uuid = uuid!("0000ff02-0000-1000-8000-00805f9b34fb");
