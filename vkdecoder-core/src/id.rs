//! Boxed handle encoding.
//!
//! Every handle the guest sees is an opaque 64-bit token minted by the
//! [`registry`](crate::registry): `index` addresses a registry slot,
//! `epoch` distinguishes reuses of the slot, and `tag` names the Vulkan
//! object kind so unboxing can detect type confusion from a hostile
//! guest. Index 0 is never allocated, so a boxed token is never equal to
//! `VK_NULL_HANDLE`.

use ash::vk::{self, Handle};

const INDEX_BITS: u64 = 32;
const EPOCH_BITS: u64 = 24;
const EPOCH_MASK: u64 = (1 << EPOCH_BITS) - 1;

/// Vulkan object kind carried in the top byte of a boxed handle.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Instance = 1,
    PhysicalDevice,
    Device,
    Queue,
    CommandBuffer,
    DeviceMemory,
    Buffer,
    Image,
    ImageView,
    Sampler,
    Semaphore,
    Fence,
    CommandPool,
    DescriptorPool,
    DescriptorSet,
    DescriptorSetLayout,
    DescriptorUpdateTemplate,
    ShaderModule,
    PipelineCache,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
}

impl ObjectType {
    pub fn from_u8(value: u8) -> Option<Self> {
        if (1..=ObjectType::Framebuffer as u8).contains(&value) {
            // Discriminants are contiguous from 1.
            Some(unsafe { std::mem::transmute::<u8, ObjectType>(value) })
        } else {
            None
        }
    }

    /// Dispatchable objects carry a dispatch table in their registry entry.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            Self::Instance | Self::PhysicalDevice | Self::Device | Self::Queue | Self::CommandBuffer
        )
    }
}

pub(crate) fn zip(index: u32, epoch: u32, tag: ObjectType) -> u64 {
    debug_assert!(index != 0);
    debug_assert!(u64::from(epoch) <= EPOCH_MASK);
    u64::from(index)
        | (u64::from(epoch) & EPOCH_MASK) << INDEX_BITS
        | (tag as u64) << (INDEX_BITS + EPOCH_BITS)
}

pub(crate) fn unzip(boxed: u64) -> (u32, u32, Option<ObjectType>) {
    let index = boxed as u32;
    let epoch = ((boxed >> INDEX_BITS) & EPOCH_MASK) as u32;
    let tag = ObjectType::from_u8((boxed >> (INDEX_BITS + EPOCH_BITS)) as u8);
    (index, epoch, tag)
}

/// Maps an `ash` handle type to its registry tag, so unboxing can be
/// written generically while staying type-checked at the call site.
pub trait TypedVkHandle: Handle + Copy {
    const TAG: ObjectType;
}

macro_rules! typed_handles {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(impl TypedVkHandle for $ty {
            const TAG: ObjectType = ObjectType::$tag;
        })*
    };
}

typed_handles! {
    vk::Instance => Instance,
    vk::PhysicalDevice => PhysicalDevice,
    vk::Device => Device,
    vk::Queue => Queue,
    vk::CommandBuffer => CommandBuffer,
    vk::DeviceMemory => DeviceMemory,
    vk::Buffer => Buffer,
    vk::Image => Image,
    vk::ImageView => ImageView,
    vk::Sampler => Sampler,
    vk::Semaphore => Semaphore,
    vk::Fence => Fence,
    vk::CommandPool => CommandPool,
    vk::DescriptorPool => DescriptorPool,
    vk::DescriptorSet => DescriptorSet,
    vk::DescriptorSetLayout => DescriptorSetLayout,
    vk::DescriptorUpdateTemplate => DescriptorUpdateTemplate,
    vk::ShaderModule => ShaderModule,
    vk::PipelineCache => PipelineCache,
    vk::PipelineLayout => PipelineLayout,
    vk::Pipeline => Pipeline,
    vk::RenderPass => RenderPass,
    vk::Framebuffer => Framebuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_unzip_round_trip() {
        let boxed = zip(7, 3, ObjectType::Image);
        let (index, epoch, tag) = unzip(boxed);
        assert_eq!(index, 7);
        assert_eq!(epoch, 3);
        assert_eq!(tag, Some(ObjectType::Image));
    }

    #[test]
    fn tag_survives_every_kind() {
        for raw in 1..=ObjectType::Framebuffer as u8 {
            let tag = ObjectType::from_u8(raw).unwrap();
            assert_eq!(tag as u8, raw);
            let (_, _, got) = unzip(zip(1, 1, tag));
            assert_eq!(got, Some(tag));
        }
        assert_eq!(ObjectType::from_u8(0), None);
        assert_eq!(ObjectType::from_u8(200), None);
    }
}
