// THEORY:
// The `CameraPool` is the lifecycle manager for a changing set of cameras. It is
// the only place sources are created or destroyed, and it only does so inside
// `reconcile`, which the driver calls with exclusive ownership of the pool.
//
// Key architectural principles:
// 1.  **Gated reconcile**: device discovery and liveness probing are expensive,
//     so a reconcile runs at most once per interval. Calls in between are free
//     no-ops, which lets the driver call it every tick.
// 2.  **Detach before attach**: dead sources (a failed read since the last pass,
//     a closed handle, a failed probe, or a device that vanished from discovery)
//     are removed first so their slots can be refilled in the same pass.
// 3.  **Stable identity**: membership is keyed by the provider's `DeviceId`.
//     A new source takes the lowest free slot and keeps it for as long as it is
//     attached; labels, clip names and grid order all derive from the slot.
// 4.  **Isolation**: an open or probe failure affects only that device. It is
//     logged and retried on a later pass; nothing propagates to the caller.

use crate::capture::DeviceProvider;
use crate::core_modules::camera_source::{CameraSource, SourceFrame, SourceSettings};
use crate::core_modules::frame::{DeviceId, DeviceInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Devices attached and detached by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attached: BTreeSet<DeviceId>,
    pub detached: BTreeSet<DeviceId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Lets a reconcile through at most once per `interval`.
#[derive(Debug, Clone)]
pub struct ReconcileGate {
    interval: Duration,
    last: Option<Instant>,
}

impl ReconcileGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

pub(crate) fn lowest_free_slot<V>(occupied: &BTreeMap<usize, V>, max_size: usize) -> Option<usize> {
    (0..max_size).find(|slot| !occupied.contains_key(slot))
}

/// Opens discovered devices that are not attached yet, in discovery order,
/// until `occupied` holds `max_size` entries. New slots are recorded in
/// `occupied`.
pub(crate) fn attach_devices(
    provider: &mut dyn DeviceProvider,
    settings: &SourceSettings,
    read_timeout: Duration,
    devices: &[DeviceInfo],
    occupied: &mut BTreeMap<usize, DeviceId>,
    max_size: usize,
) -> Vec<CameraSource> {
    let mut attached = Vec::new();
    for device in devices {
        if occupied.values().any(|id| *id == device.id) {
            continue;
        }
        let Some(slot) = lowest_free_slot(occupied, max_size) else {
            tracing::debug!(device = %device.id, "pool full, device left unattached");
            break;
        };

        match provider.open(device, read_timeout) {
            Ok(source) => {
                let camera = settings.build(slot, device.clone(), source);
                tracing::info!(slot, device = %device.id, "camera attached");
                settings
                    .events
                    .append(&format!("Camera '{}' connected.", camera.name()));
                occupied.insert(slot, device.id.clone());
                attached.push(camera);
            }
            Err(err) => {
                tracing::warn!(device = %device.id, error = %err, "camera could not be opened");
                settings
                    .events
                    .append(&format!("Camera '{}' NOT available.", device.display_name()));
            }
        }
    }
    attached
}

pub struct CameraPool {
    provider: Box<dyn DeviceProvider>,
    settings: SourceSettings,
    max_size: usize,
    read_timeout: Duration,
    gate: ReconcileGate,
    sources: BTreeMap<usize, CameraSource>,
}

impl CameraPool {
    pub fn new(
        provider: Box<dyn DeviceProvider>,
        settings: SourceSettings,
        max_size: usize,
        reconcile_interval: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            settings,
            max_size,
            read_timeout,
            gate: ReconcileGate::new(reconcile_interval),
            sources: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    /// Attached devices, in slot order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.sources
            .values()
            .map(|source| source.device_id().clone())
            .collect()
    }

    pub fn slots(&self) -> Vec<usize> {
        self.sources.keys().copied().collect()
    }

    pub fn source(&self, slot: usize) -> Option<&CameraSource> {
        self.sources.get(&slot)
    }

    /// Reconciles if the interval has elapsed since the last pass.
    pub fn reconcile(&mut self, now: Instant) -> ReconcileReport {
        if !self.gate.is_due(now) {
            return ReconcileReport::default();
        }
        self.force_reconcile(now)
    }

    /// Reconciles regardless of the interval (used at startup).
    pub fn force_reconcile(&mut self, now: Instant) -> ReconcileReport {
        self.gate.mark(now);
        let devices = self.provider.discover();
        self.reconcile_devices(&devices)
    }

    /// One reconcile pass against an explicit device list.
    pub fn reconcile_devices(&mut self, devices: &[DeviceInfo]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let dead: Vec<usize> = self
            .sources
            .iter_mut()
            .filter_map(|(slot, source)| {
                let present = devices.iter().any(|d| d.id == *source.device_id());
                let alive = source.is_available() && present && source.probe();
                (!alive).then_some(*slot)
            })
            .collect();
        for slot in dead {
            if let Some(source) = self.sources.remove(&slot) {
                tracing::info!(slot, device = %source.device_id(), "camera detached");
                report.detached.insert(source.device_id().clone());
                source.detach();
            }
        }

        let mut occupied: BTreeMap<usize, DeviceId> = self
            .sources
            .iter()
            .map(|(slot, source)| (*slot, source.device_id().clone()))
            .collect();
        let attached = attach_devices(
            self.provider.as_mut(),
            &self.settings,
            self.read_timeout,
            devices,
            &mut occupied,
            self.max_size,
        );
        for camera in attached {
            report.attached.insert(camera.device_id().clone());
            self.sources.insert(camera.slot(), camera);
        }

        if !report.is_empty() {
            tracing::debug!(
                attached = report.attached.len(),
                detached = report.detached.len(),
                active = self.sources.len(),
                "reconcile finished"
            );
        }
        report
    }

    /// Runs one tick of every attached camera, in slot order.
    pub fn process_all(&mut self) -> Vec<SourceFrame> {
        self.sources
            .values_mut()
            .filter_map(CameraSource::process)
            .collect()
    }

    /// Finalises every open clip, then releases every device.
    pub fn shutdown(&mut self) {
        for source in self.sources.values_mut() {
            source.close_recording();
        }
        for source in std::mem::take(&mut self.sources).into_values() {
            source.shutdown();
        }
    }
}

impl Drop for CameraPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_opens_once_per_interval() {
        let start = Instant::now();
        let mut gate = ReconcileGate::new(Duration::from_secs(5));
        assert!(gate.is_due(start));
        gate.mark(start);
        assert!(!gate.is_due(start + Duration::from_secs(4)));
        assert!(gate.is_due(start + Duration::from_secs(5)));
    }

    #[test]
    fn lowest_free_slot_fills_gaps() {
        let mut occupied = BTreeMap::new();
        assert_eq!(lowest_free_slot(&occupied, 3), Some(0));
        occupied.insert(0, ());
        occupied.insert(2, ());
        assert_eq!(lowest_free_slot(&occupied, 3), Some(1));
        occupied.insert(1, ());
        assert_eq!(lowest_free_slot(&occupied, 3), None);
    }
}
