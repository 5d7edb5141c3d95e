//! Error kinds surfaced to the guest.
//!
//! Driver failures travel as raw `vk::Result` codes; [`VkError`] mirrors
//! the subset the decoder itself originates so call sites can use `?`
//! and still hand the guest an honest Vulkan result.

use ash::vk;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VkError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of pool memory")]
    OutOfPoolMemory,
    #[error("initialization failed")]
    InitializationFailed,
    #[error("device lost")]
    DeviceLost,
    #[error("incompatible driver")]
    IncompatibleDriver,
    #[error("feature not present")]
    FeatureNotPresent,
    #[error("format not supported")]
    FormatNotSupported,
    #[error("invalid external handle")]
    InvalidExternalHandle,
    #[error("memory map failed")]
    MemoryMapFailed,
    #[error("driver returned {0:?}")]
    Driver(vk::Result),
    #[error("unknown error")]
    Unknown,
}

impl VkError {
    pub fn as_result(self) -> vk::Result {
        match self {
            Self::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            Self::OutOfDeviceMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            Self::OutOfPoolMemory => vk::Result::ERROR_OUT_OF_POOL_MEMORY,
            Self::InitializationFailed => vk::Result::ERROR_INITIALIZATION_FAILED,
            Self::DeviceLost => vk::Result::ERROR_DEVICE_LOST,
            Self::IncompatibleDriver => vk::Result::ERROR_INCOMPATIBLE_DRIVER,
            Self::FeatureNotPresent => vk::Result::ERROR_FEATURE_NOT_PRESENT,
            Self::FormatNotSupported => vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            Self::InvalidExternalHandle => vk::Result::ERROR_INVALID_EXTERNAL_HANDLE,
            Self::MemoryMapFailed => vk::Result::ERROR_MEMORY_MAP_FAILED,
            Self::Driver(result) => result,
            Self::Unknown => vk::Result::ERROR_UNKNOWN,
        }
    }
}

impl From<vk::Result> for VkError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfPoolMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::IncompatibleDriver,
            vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureNotPresent,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::FormatNotSupported,
            vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => Self::InvalidExternalHandle,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            other => Self::Driver(other),
        }
    }
}

/// Helpers for reporting `vk::Result` values the way the decoder reports
/// them: out-of-memory results feed the metrics hook with the failing op
/// and, when known, the allocation size.
pub trait VkResultExt {
    fn is_out_of_memory(&self) -> bool;
    fn log_oom(&self, op: &'static str, size: Option<u64>);
}

impl VkResultExt for vk::Result {
    fn is_out_of_memory(&self) -> bool {
        matches!(
            *self,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        )
    }

    fn log_oom(&self, op: &'static str, size: Option<u64>) {
        if self.is_out_of_memory() {
            match size {
                Some(size) => {
                    log::error!("metrics: out-of-memory in {op} (size {size}): {self:?}")
                }
                None => log::error!("metrics: out-of-memory in {op}: {self:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_round_trips_through_vk_result() {
        for err in [
            VkError::OutOfHostMemory,
            VkError::OutOfPoolMemory,
            VkError::FeatureNotPresent,
            VkError::InvalidExternalHandle,
        ] {
            assert_eq!(VkError::from(err.as_result()), err);
        }
    }
}
