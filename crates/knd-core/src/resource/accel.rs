//! Accelerator share accounting.
//!
//! Accelerator allocation is delegated per accelerator class to a pluggable
//! allocator so heterogeneous device types (and fractional shares of one
//! device) coexist behind one contract. Shares are integer units — by
//! default 1000 units per device — so fractional reservations stay exact
//! without floating-point accounting.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::ResourceError;
use crate::config::AcceleratorConfig;

/// Default share units per physical device (one unit = 1/1000 device).
pub const DEFAULT_UNITS_PER_DEVICE: u64 = 1000;

/// A reservation handed out by an accelerator allocator.
///
/// Records per-device unit amounts so release is exact even when a
/// reservation spans devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorReservation {
    /// The plugin that issued this reservation.
    pub plugin_id: String,
    /// Units reserved per device id.
    pub device_units: BTreeMap<String, u64>,
}

impl AcceleratorReservation {
    /// Total reserved units across devices.
    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.device_units.values().sum()
    }
}

/// Pluggable per-class accelerator allocator.
///
/// Implementations must never reserve beyond their capacity: the sum of
/// live reservations' units never exceeds `capacity_units()`.
pub trait AcceleratorAllocator: Send + Sync + std::fmt::Debug {
    /// Plugin identifier referenced by resource requests.
    fn plugin_id(&self) -> &str;

    /// Total share units across all devices.
    fn capacity_units(&self) -> u64;

    /// Currently unreserved share units.
    fn free_units(&self) -> u64;

    /// Reserves the given number of share units.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InsufficientShares`] when fewer units are
    /// free than requested.
    fn reserve(&self, units: u64) -> Result<AcceleratorReservation, ResourceError>;

    /// Returns a reservation's units to the pool.
    ///
    /// Releasing a reservation twice must not free units twice; callers
    /// release each grant exactly once and implementations may clamp.
    fn release(&self, reservation: &AcceleratorReservation);
}

#[derive(Debug)]
struct DeviceSlot {
    capacity: u64,
    used: u64,
}

/// Stock allocator: a homogeneous pool of devices with fractional shares.
///
/// Reservation spreads across devices most-free-first, so a request larger
/// than one device's remaining capacity is satisfied by combining partial
/// shares of several devices.
#[derive(Debug)]
pub struct FractionalDevicePool {
    plugin_id: String,
    devices: Mutex<BTreeMap<String, DeviceSlot>>,
}

impl FractionalDevicePool {
    /// Creates a pool of `device_count` devices with `units_per_device`
    /// capacity each.
    #[must_use]
    pub fn new(plugin_id: impl Into<String>, device_count: u32, units_per_device: u64) -> Self {
        let plugin_id = plugin_id.into();
        let devices = (0..device_count)
            .map(|idx| {
                (
                    format!("{plugin_id}:{idx}"),
                    DeviceSlot {
                        capacity: units_per_device,
                        used: 0,
                    },
                )
            })
            .collect();
        Self {
            plugin_id,
            devices: Mutex::new(devices),
        }
    }

    /// Builds a pool from its configuration entry.
    #[must_use]
    pub fn from_config(config: &AcceleratorConfig) -> Self {
        Self::new(
            config.plugin_id.clone(),
            config.devices,
            config.units_per_device,
        )
    }
}

impl AcceleratorAllocator for FractionalDevicePool {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn capacity_units(&self) -> u64 {
        let devices = self.devices.lock().expect("lock poisoned");
        devices.values().map(|slot| slot.capacity).sum()
    }

    fn free_units(&self) -> u64 {
        let devices = self.devices.lock().expect("lock poisoned");
        devices.values().map(|slot| slot.capacity - slot.used).sum()
    }

    fn reserve(&self, units: u64) -> Result<AcceleratorReservation, ResourceError> {
        let mut devices = self.devices.lock().expect("lock poisoned");
        let free: u64 = devices.values().map(|slot| slot.capacity - slot.used).sum();
        if free < units {
            return Err(ResourceError::InsufficientShares {
                plugin_id: self.plugin_id.clone(),
                requested: units,
                free,
            });
        }

        // Most-free device first, then stable by id.
        let mut order: Vec<String> = devices.keys().cloned().collect();
        order.sort_by_key(|id| {
            let slot = &devices[id];
            std::cmp::Reverse(slot.capacity - slot.used)
        });

        let mut remaining = units;
        let mut device_units = BTreeMap::new();
        for id in order {
            if remaining == 0 {
                break;
            }
            let slot = devices.get_mut(&id).expect("device exists");
            let take = remaining.min(slot.capacity - slot.used);
            if take > 0 {
                slot.used += take;
                device_units.insert(id, take);
                remaining -= take;
            }
        }
        debug_assert_eq!(remaining, 0);

        Ok(AcceleratorReservation {
            plugin_id: self.plugin_id.clone(),
            device_units,
        })
    }

    fn release(&self, reservation: &AcceleratorReservation) {
        let mut devices = self.devices.lock().expect("lock poisoned");
        for (device_id, units) in &reservation.device_units {
            if let Some(slot) = devices.get_mut(device_id) {
                slot.used = slot.used.saturating_sub(*units);
            }
        }
    }
}
