//! Accelerator discovery and memory probing.

use anyhow::Result;
use candle_core::Device;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;

/// Free / total accelerator memory in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VramInfo {
    pub free: usize,
    pub total: usize,
}

impl VramInfo {
    pub fn total_mb(&self) -> usize {
        self.total / 1024 / 1024
    }
}

/// Returns (0, 0) if CUDA is not available or disabled.
pub fn get_vram_info(_device_id: usize) -> Result<VramInfo> {
    #[cfg(feature = "cuda")]
    {
        match CudaDevice::new(_device_id) {
            Ok(_dev) => {
                use cudarc::driver::result::mem_get_info;
                let (free, total) = mem_get_info()?;
                Ok(VramInfo { free, total })
            }
            Err(e) => {
                tracing::warn!("Failed to initialize CUDA device {}: {:?}", _device_id, e);
                Ok(VramInfo::default())
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        Ok(VramInfo::default())
    }
}

/// Picks the compute device. `force_cpu` wins over any detected accelerator.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("CUDA device unavailable ({e}), using CPU");
            Device::Cpu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_cpu() {
        assert!(select_device(true).is_cpu());
    }
}
