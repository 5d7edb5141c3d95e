//! End-to-end decoder scenarios against the mock driver.

mod common;

use std::ffi::CString;

use ash::vk::{self, Handle};

use common::{test_context, TestContext};
use vkdecoder_core::memory::{MemoryAllocateParams, MemoryImport};
use vkdecoder_core::resource::{LayoutBinding, MemoryCaching};
use vkdecoder_core::stream::MemStream;
use vkdecoder_core::Features;

const EXTERNAL_MEMORY_CAPS: &str = "VK_KHR_external_memory_capabilities";

fn create_instance(ctx: &TestContext, extensions: &[&str]) -> vk::Instance {
    let cstrings: Vec<CString> = extensions
        .iter()
        .map(|e| CString::new(*e).unwrap())
        .collect();
    let ptrs: Vec<*const std::os::raw::c_char> = cstrings.iter().map(|c| c.as_ptr()).collect();
    let app_name = CString::new("decoder-tests").unwrap();
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .api_version(vk::API_VERSION_1_1);
    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&ptrs);
    unsafe { ctx.global.on_create_instance(&create_info, 1).unwrap() }
}

fn enumerate_one(ctx: &TestContext, instance: vk::Instance) -> vk::PhysicalDevice {
    let mut count = 0u32;
    assert_eq!(
        ctx.global
            .on_enumerate_physical_devices(instance, &mut count, None),
        vk::Result::SUCCESS
    );
    assert_eq!(count, 1);
    let mut devices = vec![vk::PhysicalDevice::null(); count as usize];
    assert_eq!(
        ctx.global
            .on_enumerate_physical_devices(instance, &mut count, Some(&mut devices)),
        vk::Result::SUCCESS
    );
    devices[0]
}

fn create_device(ctx: &TestContext, pd: vk::PhysicalDevice, queue_count: u32) -> vk::Device {
    let priorities = [1.0f32, 1.0];
    let queue_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(0)
        .queue_priorities(&priorities[..queue_count as usize])
        .build();
    let queue_infos = [queue_info];
    let create_info = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_infos);
    unsafe {
        ctx.global
            .on_create_device(pd, &create_info, Some(7))
            .unwrap()
    }
}

fn setup(ctx: &TestContext) -> (vk::Instance, vk::PhysicalDevice, vk::Device) {
    let instance = create_instance(ctx, &[EXTERNAL_MEMORY_CAPS]);
    let pd = enumerate_one(ctx, instance);
    let device = create_device(ctx, pd, 1);
    (instance, pd, device)
}

fn host_visible_alloc(size: u64) -> MemoryAllocateParams {
    MemoryAllocateParams {
        allocation_size: size,
        guest_memory_type_index: 1,
        import: MemoryImport::None,
        export_requested: false,
        protected: false,
        caching: MemoryCaching::Cached,
    }
}

#[test]
fn instance_create_destroy_round_trip() {
    let ctx = test_context(Features::empty(), true);
    assert_eq!(ctx.global.tracked_object_count(), 0);

    let instance = create_instance(&ctx, &[EXTERNAL_MEMORY_CAPS]);
    assert_eq!(ctx.global.tracked_object_count(), 1);
    assert_eq!(ctx.driver.call_count("create_instance"), 1);

    ctx.global.on_destroy_instance(instance);
    assert_eq!(ctx.global.tracked_object_count(), 0);
    assert_eq!(ctx.driver.call_count("destroy_instance"), 1);
    assert_eq!(ctx.global.live_boxed_count(), 0);
}

#[test]
fn image_memory_lifecycle_reaches_driver_once() {
    let ctx = test_context(Features::empty(), true);
    let (_, _, device) = setup(&ctx);
    let baseline = ctx.global.tracked_object_count();

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_UNORM)
        .extent(vk::Extent3D {
            width: 256,
            height: 256,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe { ctx.global.on_create_image(device, &image_info, None).unwrap() };
    let requirements = ctx.global.on_get_image_memory_requirements(device, image);
    assert_eq!(requirements.size, 256 * 256 * 4);

    let memory = ctx
        .global
        .on_allocate_memory(device, &host_visible_alloc(requirements.size))
        .unwrap();
    ctx.global
        .on_bind_image_memory(device, image, memory, 0)
        .unwrap();
    assert_eq!(ctx.global.tracked_object_count(), baseline + 2);

    ctx.global.on_destroy_image(device, image);
    ctx.global.on_free_memory(device, memory);
    assert_eq!(ctx.global.tracked_object_count(), baseline);

    assert_eq!(ctx.driver.call_count("create_image"), 1);
    assert_eq!(ctx.driver.call_count("bind_image_memory"), 1);
    assert_eq!(ctx.driver.call_count("destroy_image"), 1);
    assert_eq!(ctx.driver.call_count("free_memory"), 1);
}

#[test]
fn virtual_queue_defers_wait_before_signal() {
    let ctx = test_context(Features::VIRTUAL_QUEUE, true);
    let (_, _, device) = setup_with_queues(&ctx, 2);

    let queue_physical = ctx.global.on_get_device_queue(device, 0, 0).unwrap();
    let queue_virtual = ctx.global.on_get_device_queue(device, 0, 1).unwrap();
    assert_ne!(queue_physical, queue_virtual);

    let sem_s = ctx.global.on_create_semaphore(device, false, Some(0)).unwrap();
    let sem_t = ctx.global.on_create_semaphore(device, false, Some(0)).unwrap();
    let fence_a = ctx
        .global
        .on_create_fence(device, &vk::FenceCreateInfo::builder(), false)
        .unwrap();

    let submits_before = ctx.driver.call_count("queue_submit2");

    // Submission A: waits S=5, signals T=1. S has never been signalled,
    // so A must park instead of reaching the driver.
    {
        let waits = [vk::SemaphoreSubmitInfo::builder()
            .semaphore(sem_s)
            .value(5)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .build()];
        let signals = [vk::SemaphoreSubmitInfo::builder()
            .semaphore(sem_t)
            .value(1)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .build()];
        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals)
            .build();
        unsafe {
            ctx.global
                .on_queue_submit2(queue_virtual, &[submit], fence_a)
                .unwrap();
        }
    }
    assert_eq!(ctx.driver.call_count("queue_submit2"), submits_before);
    assert_eq!(
        ctx.global.on_get_fence_status(device, fence_a),
        Ok(false),
        "fence of a deferred submission must report NOT_READY"
    );

    // Submission B signals S=5, which makes A dispatchable.
    {
        let signals = [vk::SemaphoreSubmitInfo::builder()
            .semaphore(sem_s)
            .value(5)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .build()];
        let submit = vk::SubmitInfo2::builder()
            .signal_semaphore_infos(&signals)
            .build();
        unsafe {
            ctx.global
                .on_queue_submit2(queue_physical, &[submit], vk::Fence::null())
                .unwrap();
        }
    }

    assert!(ctx.driver.call_count("queue_submit2") >= submits_before + 2);
    assert_eq!(ctx.global.on_get_fence_status(device, fence_a), Ok(true));
    assert_eq!(
        ctx.global.on_get_semaphore_counter_value(device, sem_t),
        Ok(1)
    );
}

fn setup_with_queues(ctx: &TestContext, queue_count: u32) -> (vk::Instance, vk::PhysicalDevice, vk::Device) {
    let instance = create_instance(ctx, &[]);
    let pd = enumerate_one(ctx, instance);
    // The guest-facing family table advertises the virtual twin.
    let families = ctx.global.on_get_physical_device_queue_family_properties(pd);
    assert!(families[0].queue_count >= queue_count);
    let device = create_device(ctx, pd, queue_count);
    (instance, pd, device)
}

#[test]
fn descriptor_pool_exhausts_and_recovers() {
    let ctx = test_context(Features::empty(), true);
    let (_, _, device) = setup(&ctx);

    let layout = ctx
        .global
        .on_create_descriptor_set_layout(
            device,
            &[LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::ALL,
            }],
        )
        .unwrap();
    let pool = ctx
        .global
        .on_create_descriptor_pool(
            device,
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            16,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2,
            }],
        )
        .unwrap();

    let first = ctx
        .global
        .on_allocate_descriptor_sets(device, pool, &[layout])
        .unwrap();
    ctx.global
        .on_allocate_descriptor_sets(device, pool, &[layout])
        .unwrap();
    assert_eq!(
        ctx.global
            .on_allocate_descriptor_sets(device, pool, &[layout])
            .unwrap_err(),
        vk::Result::ERROR_OUT_OF_POOL_MEMORY
    );

    ctx.global
        .on_free_descriptor_sets(device, pool, &first)
        .unwrap();
    ctx.global
        .on_allocate_descriptor_sets(device, pool, &[layout])
        .unwrap();
}

#[test]
fn reset_descriptor_pool_restores_capacity() {
    let ctx = test_context(Features::empty(), true);
    let (_, _, device) = setup(&ctx);

    let layout = ctx
        .global
        .on_create_descriptor_set_layout(
            device,
            &[LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::ALL,
            }],
        )
        .unwrap();
    let pool = ctx
        .global
        .on_create_descriptor_pool(
            device,
            vk::DescriptorPoolCreateFlags::empty(),
            2,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2,
            }],
        )
        .unwrap();

    ctx.global
        .on_allocate_descriptor_sets(device, pool, &[layout, layout])
        .unwrap();
    assert!(ctx
        .global
        .on_allocate_descriptor_sets(device, pool, &[layout])
        .is_err());
    ctx.global.on_reset_descriptor_pool(device, pool).unwrap();
    ctx.global
        .on_allocate_descriptor_sets(device, pool, &[layout, layout])
        .unwrap();
}

#[test]
fn etc2_image_is_emulated_with_compute_decompression() {
    // Driver without native ETC2.
    let ctx = test_context(Features::empty(), false);
    let (_, _, device) = setup(&ctx);

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::ETC2_R8G8B8_UNORM_BLOCK)
        .extent(vk::Extent3D {
            width: 256,
            height: 256,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe { ctx.global.on_create_image(device, &image_info, None).unwrap() };

    // Output + one mip alias reach the driver.
    assert_eq!(ctx.driver.call_count("create_image"), 2);

    // Requirements reflect the uncompressed output image.
    let requirements = ctx.global.on_get_image_memory_requirements(device, image);
    assert_eq!(requirements.size, 256 * 256 * 4);

    let memory = ctx
        .global
        .on_allocate_memory(device, &host_visible_alloc(requirements.size))
        .unwrap();
    ctx.global
        .on_bind_image_memory(device, image, memory, 0)
        .unwrap();

    // Upload compressed data, then transition to sampling.
    let staging_size = (64 * 64 * 8) as u64; // 4x4 blocks, 8 bytes each
    let staging = ctx
        .global
        .on_create_buffer(device, staging_size, vk::BufferUsageFlags::TRANSFER_SRC)
        .unwrap();
    let staging_memory = ctx
        .global
        .on_allocate_memory(device, &host_visible_alloc(staging_size))
        .unwrap();
    ctx.global
        .on_bind_buffer_memory(device, staging, staging_memory, 0)
        .unwrap();

    let pool = ctx
        .global
        .on_create_command_pool(device, vk::CommandPoolCreateFlags::empty(), 0)
        .unwrap();
    let cb = ctx
        .global
        .on_allocate_command_buffers(device, pool, vk::CommandBufferLevel::PRIMARY, 1)
        .unwrap()[0];
    ctx.global
        .on_begin_command_buffer(cb, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap();

    let region = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: 256,
            height: 256,
            depth: 1,
        },
    };
    ctx.global
        .on_cmd_copy_buffer_to_image(
            cb,
            staging,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        )
        .unwrap();
    assert_eq!(ctx.driver.call_count("cmd_copy_buffer_to_image"), 1);

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();
    ctx.global
        .on_cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
        .unwrap();

    // The readable-layout transition must have stitched in the compute
    // decompression pass.
    assert!(ctx.driver.call_count("create_compute_pipelines") >= 1);
    assert!(ctx.driver.call_count("cmd_dispatch") >= 1);
    assert!(ctx.driver.call_count("cmd_bind_pipeline") >= 1);
}

#[test]
fn snapshot_round_trip_preserves_memory_and_handles() {
    let features = Features::SNAPSHOTS | Features::BATCHED_DESCRIPTOR_SET_UPDATE;
    let saved = {
        let ctx = test_context(features, true);
        let (_, _, device) = setup(&ctx);

        let memory = ctx
            .global
            .on_allocate_memory(device, &host_visible_alloc(64 * 1024))
            .unwrap();
        let ptr = ctx
            .global
            .on_map_memory(device, memory, 0, vk::WHOLE_SIZE)
            .unwrap();
        unsafe { std::ptr::write_bytes(ptr, 0xA5, 64 * 1024) };

        let buffer = ctx
            .global
            .on_create_buffer(
                device,
                64 * 1024,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .unwrap();
        ctx.global
            .on_bind_buffer_memory(device, buffer, memory, 0)
            .unwrap();

        // A no-op submission through the fence gate.
        let fence = ctx
            .global
            .on_create_fence(device, &vk::FenceCreateInfo::builder(), false)
            .unwrap();
        let queue = ctx.global.on_get_device_queue(device, 0, 0).unwrap();
        let submit = vk::SubmitInfo2::builder().build();
        unsafe {
            ctx.global.on_queue_submit2(queue, &[submit], fence).unwrap();
        }
        ctx.global
            .on_wait_for_fences(device, &[fence], true, 1_000_000_000)
            .unwrap();

        let mut stream = MemStream::new();
        ctx.global.snapshot_save(&mut stream).unwrap();
        (stream.into_bytes(), memory, buffer, device)
    };
    let (bytes, memory, buffer, device) = saved;

    // A fresh decoder world stands in for "everything destroyed".
    let ctx = test_context(features, true);
    let mut stream = MemStream::from_bytes(bytes);
    ctx.global.snapshot_load(&mut stream).unwrap();

    // The boxed tokens from before the save are valid again.
    let requirements = ctx.global.on_get_buffer_memory_requirements(device, buffer);
    assert_eq!(requirements.size, 64 * 1024);

    let ptr = ctx
        .global
        .on_map_memory(device, memory, 0, vk::WHOLE_SIZE)
        .unwrap();
    let contents = unsafe { std::slice::from_raw_parts(ptr, 64 * 1024) };
    assert!(contents.iter().all(|&b| b == 0xA5));
}

#[test]
fn enumerate_with_short_buffer_reports_incomplete() {
    let ctx = test_context(Features::empty(), true);
    let instance = create_instance(&ctx, &[]);

    let mut count = 0u32;
    ctx.global
        .on_enumerate_physical_devices(instance, &mut count, None);
    assert_eq!(count, 1);

    let mut zero = 0u32;
    let mut out: [vk::PhysicalDevice; 0] = [];
    assert_eq!(
        ctx.global
            .on_enumerate_physical_devices(instance, &mut zero, Some(&mut out)),
        vk::Result::INCOMPLETE
    );
    assert_eq!(zero, 0);
}

#[test]
fn fence_status_tracks_submission_state() {
    let ctx = test_context(Features::empty(), true);
    let (_, _, device) = setup(&ctx);

    let fence = ctx
        .global
        .on_create_fence(device, &vk::FenceCreateInfo::builder(), false)
        .unwrap();
    // Never submitted: NOT_READY.
    assert_eq!(ctx.global.on_get_fence_status(device, fence), Ok(false));

    let queue = ctx.global.on_get_device_queue(device, 0, 0).unwrap();
    let submit = vk::SubmitInfo2::builder().build();
    unsafe {
        ctx.global.on_queue_submit2(queue, &[submit], fence).unwrap();
    }
    assert_eq!(ctx.global.on_get_fence_status(device, fence), Ok(true));

    ctx.global.on_reset_fences(device, &[fence]).unwrap();
    assert_eq!(ctx.global.on_get_fence_status(device, fence), Ok(false));

    // Unknown handles report success (treated as pre-signalled).
    let bogus = vk::Fence::from_raw(0xdead_0000_0000_0001);
    assert_eq!(ctx.global.on_get_fence_status(device, bogus), Ok(true));
}

#[test]
fn timeline_signal_value_is_monotonic() {
    let ctx = test_context(Features::VIRTUAL_QUEUE, true);
    let (_, _, device) = setup_with_queues(&ctx, 2);
    let semaphore = ctx.global.on_create_semaphore(device, false, Some(0)).unwrap();

    ctx.global.on_signal_semaphore(device, semaphore, 10).unwrap();
    assert_eq!(
        ctx.global.on_get_semaphore_counter_value(device, semaphore),
        Ok(10)
    );
    // Lowering is silently ignored by the tracker and the driver keeps
    // its own max.
    ctx.global.on_signal_semaphore(device, semaphore, 4).unwrap();
    assert_eq!(
        ctx.global.on_get_semaphore_counter_value(device, semaphore),
        Ok(10)
    );
}

#[test]
fn device_teardown_clears_owned_tables() {
    let ctx = test_context(Features::empty(), true);
    let (instance, _, device) = setup(&ctx);

    let memory = ctx
        .global
        .on_allocate_memory(device, &host_visible_alloc(4096))
        .unwrap();
    let buffer = ctx
        .global
        .on_create_buffer(device, 4096, vk::BufferUsageFlags::TRANSFER_DST)
        .unwrap();
    ctx.global
        .on_bind_buffer_memory(device, buffer, memory, 0)
        .unwrap();
    let _fence = ctx
        .global
        .on_create_fence(device, &vk::FenceCreateInfo::builder(), false)
        .unwrap();
    let _semaphore = ctx.global.on_create_semaphore(device, false, None).unwrap();

    ctx.global.on_destroy_device(device);
    // Only the instance and its physical device remain.
    assert_eq!(ctx.global.tracked_object_count(), 2);
    assert!(ctx.driver.call_count("destroy_device") == 1);
    assert!(ctx.driver.call_count("free_memory") >= 1);
    assert!(ctx.driver.call_count("destroy_buffer") >= 1);

    ctx.global.on_destroy_instance(instance);
    assert_eq!(ctx.global.tracked_object_count(), 0);
    assert_eq!(ctx.global.live_boxed_count(), 0);
}
