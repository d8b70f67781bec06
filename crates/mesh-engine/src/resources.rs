//! Resource pool manager
//!
//! Devices are created once from configuration and never removed. Each device
//! keeps its own ledger behind its own lock, so allocations on different
//! devices never contend. There is no pool-wide lock.

use async_trait::async_trait;
use mesh_core::{DeviceConfig, DeviceKind, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Float slack when comparing fractions against capacity
const CAPACITY_EPSILON: f64 = 1e-9;

/// One allocation of a device fraction to a model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHandle {
    pub id: u64,
    pub device_id: String,
    pub device_kind: DeviceKind,
    pub fraction: f64,
    pub owner: String,
}

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub kind: DeviceKind,
    pub capacity: f64,
    pub allocated: f64,
    pub live: bool,
    pub owners: Vec<String>,
}

impl DeviceSnapshot {
    pub fn free(&self) -> f64 {
        (self.capacity - self.allocated).max(0.0)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity <= 0.0 {
            0.0
        } else {
            self.allocated / self.capacity
        }
    }
}

/// A loaded model that could be unloaded to make room
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub model: String,
    pub device_id: String,
    pub fraction: f64,
    pub last_access: Instant,
    pub priority_class: u8,
}

/// Supplies and unloads idle models on behalf of the pool
#[async_trait]
pub trait Evictor: Send + Sync {
    /// Ready models with no in-flight work holding a device of `kind`
    fn candidates(&self, kind: DeviceKind) -> Vec<EvictionCandidate>;

    /// Unload the candidate and release its allocation
    async fn evict(&self, candidate: &EvictionCandidate) -> Result<()>;
}

#[derive(Debug, Default)]
struct Ledger {
    allocated: f64,
    allocations: HashMap<u64, (String, f64)>,
}

#[derive(Debug)]
struct Device {
    id: String,
    kind: DeviceKind,
    capacity: f64,
    live: AtomicBool,
    ledger: Mutex<Ledger>,
}

impl Device {
    fn snapshot(&self) -> DeviceSnapshot {
        let ledger = self.ledger.lock();
        let mut owners: Vec<String> = ledger
            .allocations
            .values()
            .map(|(owner, _)| owner.clone())
            .collect();
        owners.sort();
        DeviceSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            capacity: self.capacity,
            allocated: ledger.allocated,
            live: self.live.load(Ordering::Acquire),
            owners,
        }
    }

    fn allocated(&self) -> f64 {
        self.ledger.lock().allocated
    }
}

/// Tracks device capacity and allocations
#[derive(Debug)]
pub struct ResourcePool {
    devices: Vec<Arc<Device>>,
    eviction_enabled: bool,
    next_handle: AtomicU64,
}

impl ResourcePool {
    pub fn new(devices: &[DeviceConfig], eviction_enabled: bool) -> Self {
        let devices = devices
            .iter()
            .map(|config| {
                Arc::new(Device {
                    id: config.id.clone(),
                    kind: config.kind,
                    capacity: config.capacity,
                    live: AtomicBool::new(true),
                    ledger: Mutex::new(Ledger::default()),
                })
            })
            .collect();

        Self {
            devices,
            eviction_enabled,
            next_handle: AtomicU64::new(1),
        }
    }

    /// Place `fraction` on the least-loaded live device of `kind`
    pub fn allocate(&self, kind: DeviceKind, fraction: f64, owner: &str) -> Result<ResourceHandle> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::validation(format!(
                "resource fraction must be in (0, 1], got {}",
                fraction
            )));
        }

        let mut candidates: Vec<(f64, &Arc<Device>)> = self
            .devices
            .iter()
            .filter(|d| d.kind == kind && d.live.load(Ordering::Acquire))
            .map(|d| (d.allocated() / d.capacity, d))
            .collect();
        if candidates.is_empty() {
            return Err(Error::resource_exhausted(format!(
                "no live {} device for {}",
                kind, owner
            )));
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (_, device) in candidates {
            // Loads may have changed since sorting; recheck under the device lock
            let mut ledger = device.ledger.lock();
            if ledger.allocated + fraction > device.capacity + CAPACITY_EPSILON {
                continue;
            }
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            ledger.allocated += fraction;
            ledger.allocations.insert(id, (owner.to_string(), fraction));
            debug!(
                device = %device.id,
                owner,
                fraction,
                allocated = ledger.allocated,
                "Allocated device share"
            );
            return Ok(ResourceHandle {
                id,
                device_id: device.id.clone(),
                device_kind: kind,
                fraction,
                owner: owner.to_string(),
            });
        }

        Err(Error::resource_exhausted(format!(
            "no {} device has {:.3} free for {}",
            kind, fraction, owner
        )))
    }

    /// Allocate, running one eviction pass and one retry on exhaustion
    pub async fn allocate_with_eviction(
        &self,
        kind: DeviceKind,
        fraction: f64,
        owner: &str,
        evictor: &dyn Evictor,
    ) -> Result<ResourceHandle> {
        let err = match self.allocate(kind, fraction, owner) {
            Ok(handle) => return Ok(handle),
            Err(err @ Error::ResourceExhausted(_)) if self.eviction_enabled => err,
            Err(err) => return Err(err),
        };

        let Some(victim) = self.select_victim(kind, fraction, owner, evictor.candidates(kind))
        else {
            debug!(owner, %kind, "No idle model can free enough capacity");
            return Err(err);
        };

        info!(
            victim = %victim.model,
            device = %victim.device_id,
            fraction = victim.fraction,
            requested_by = owner,
            "Evicting idle model"
        );
        if let Err(e) = self.evict_candidate(evictor, &victim).await {
            warn!(victim = %victim.model, error = %e, "Eviction failed");
            return Err(err);
        }

        self.allocate(kind, fraction, owner)
    }

    async fn evict_candidate(&self, evictor: &dyn Evictor, victim: &EvictionCandidate) -> Result<()> {
        evictor.evict(victim).await
    }

    /// Least valuable candidate whose removal makes room: least recently used
    /// first, then lowest priority class
    fn select_victim(
        &self,
        kind: DeviceKind,
        fraction: f64,
        owner: &str,
        mut candidates: Vec<EvictionCandidate>,
    ) -> Option<EvictionCandidate> {
        candidates.retain(|c| c.model != owner);
        candidates.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then(a.priority_class.cmp(&b.priority_class))
        });

        candidates.into_iter().find(|candidate| {
            self.devices
                .iter()
                .find(|d| d.id == candidate.device_id && d.kind == kind)
                .map(|device| {
                    let free = device.capacity - device.allocated();
                    device.live.load(Ordering::Acquire)
                        && free + candidate.fraction + CAPACITY_EPSILON >= fraction
                })
                .unwrap_or(false)
        })
    }

    /// Return an allocation's capacity. Releasing twice is a no-op.
    pub fn release(&self, handle: &ResourceHandle) -> bool {
        let Some(device) = self.devices.iter().find(|d| d.id == handle.device_id) else {
            return false;
        };
        let mut ledger = device.ledger.lock();
        match ledger.allocations.remove(&handle.id) {
            Some((_, fraction)) => {
                ledger.allocated = (ledger.allocated - fraction).max(0.0);
                debug!(device = %device.id, owner = %handle.owner, fraction, "Released device share");
                true
            }
            None => false,
        }
    }

    pub fn set_device_live(&self, device_id: &str, live: bool) -> Result<()> {
        let device = self
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| Error::validation(format!("unknown device {}", device_id)))?;
        let previous = device.live.swap(live, Ordering::AcqRel);
        if previous != live {
            info!(device = device_id, live, "Device liveness changed");
        }
        Ok(())
    }

    pub fn is_live(&self, device_id: &str) -> bool {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.live.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn device_usage(&self) -> Vec<DeviceSnapshot> {
        self.devices.iter().map(|d| d.snapshot()).collect()
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.snapshot())
    }

    pub fn eviction_enabled(&self) -> bool {
        self.eviction_enabled
    }
}
