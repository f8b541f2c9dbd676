use crate::core::GIB;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

/// A device running at or above this temperature is considered unhealthy
/// and skipped by admission.
const MAX_HEALTHY_TEMPERATURE_C: u32 = 85;

/// Per-device snapshot taken once per admission pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuMetrics {
    pub index: u32,
    pub name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub temperature: Option<u32>,
    pub utilization: Option<u32>,
    pub healthy: bool,
}

impl GpuMetrics {
    pub fn free_memory(&self) -> u64 {
        self.memory_total.saturating_sub(self.memory_used)
    }
}

/// Source of GPU snapshots. The scheduler treats each snapshot as read-only
/// for the duration of one admission pass.
pub trait GpuInventory: Send + Sync {
    fn list_gpus(&self) -> Vec<GpuMetrics>;
}

/// NVML-backed inventory. A probe failure on one device degrades that
/// device to unhealthy; it never fails the whole enumeration.
pub struct NvmlInventory {
    nvml: Nvml,
}

impl NvmlInventory {
    pub fn probe() -> Option<Self> {
        match Nvml::init() {
            Ok(nvml) => Some(Self { nvml }),
            Err(e) => {
                tracing::warn!("Failed to initialize NVML: {}. Running without GPU probe.", e);
                None
            }
        }
    }

    fn device_metrics(&self, index: u32) -> GpuMetrics {
        let unhealthy = |name: String| GpuMetrics {
            index,
            name,
            memory_total: 0,
            memory_used: 0,
            temperature: None,
            utilization: None,
            healthy: false,
        };

        let device = match self.nvml.device_by_index(index) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(gpu = index, "GPU probe failed: {}", e);
                return unhealthy(format!("gpu-{index}"));
            }
        };

        let name = device.name().unwrap_or_else(|_| format!("gpu-{index}"));
        let (memory_total, memory_used) = match device.memory_info() {
            Ok(mem) => (mem.total, mem.used),
            Err(e) => {
                tracing::warn!(gpu = index, "Memory probe failed: {}", e);
                return unhealthy(name);
            }
        };

        let temperature = device.temperature(TemperatureSensor::Gpu).ok();
        let utilization = device.utilization_rates().ok().map(|rates| rates.gpu);
        let healthy = temperature.is_none_or(|t| t < MAX_HEALTHY_TEMPERATURE_C);

        GpuMetrics {
            index,
            name,
            memory_total,
            memory_used,
            temperature,
            utilization,
            healthy,
        }
    }
}

impl GpuInventory for NvmlInventory {
    fn list_gpus(&self) -> Vec<GpuMetrics> {
        let count = match self.nvml.device_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to enumerate GPUs: {}", e);
                return Vec::new();
            }
        };
        (0..count).map(|i| self.device_metrics(i)).collect()
    }
}

/// Synthetic inventory for hosts without NVML. Every device is healthy with
/// a fixed capacity and no observed memory usage, so admission falls back
/// to tracking which indices are already pinned by running jobs.
pub struct VirtualInventory {
    count: u32,
    capacity: u64,
}

impl VirtualInventory {
    pub fn new(count: u32, capacity: u64) -> Self {
        Self {
            count: count.max(1),
            capacity,
        }
    }
}

impl GpuInventory for VirtualInventory {
    fn list_gpus(&self) -> Vec<GpuMetrics> {
        (0..self.count)
            .map(|index| GpuMetrics {
                index,
                name: format!("virtual-gpu-{index}"),
                memory_total: self.capacity,
                memory_used: 0,
                temperature: None,
                utilization: None,
                healthy: true,
            })
            .collect()
    }
}

/// Probe NVML, falling back to a virtual inventory so the scheduler stays
/// operable on GPU-less hosts.
pub fn detect(virtual_gpus: u32, virtual_capacity_gib: u64) -> Box<dyn GpuInventory> {
    match NvmlInventory::probe() {
        Some(inventory) => Box::new(inventory),
        None => {
            tracing::info!(
                count = virtual_gpus,
                "Using virtual GPU inventory ({} GiB per device)",
                virtual_capacity_gib
            );
            Box::new(VirtualInventory::new(virtual_gpus, virtual_capacity_gib * GIB))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_inventory_shape() {
        let inventory = VirtualInventory::new(2, 16 * GIB);
        let gpus = inventory.list_gpus();

        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "virtual-gpu-0");
        assert_eq!(gpus[1].index, 1);
        for gpu in &gpus {
            assert!(gpu.healthy);
            assert_eq!(gpu.memory_used, 0);
            assert_eq!(gpu.free_memory(), 16 * GIB);
        }
    }

    #[test]
    fn test_virtual_inventory_never_empty() {
        assert_eq!(VirtualInventory::new(0, GIB).list_gpus().len(), 1);
    }

    #[test]
    fn test_free_memory_saturates() {
        let gpu = GpuMetrics {
            index: 0,
            name: "broken".into(),
            memory_total: GIB,
            memory_used: 2 * GIB,
            temperature: None,
            utilization: None,
            healthy: false,
        };
        assert_eq!(gpu.free_memory(), 0);
    }
}
