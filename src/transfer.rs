// =============================================================================
// TRANSFER - clear a device-local image, copy it to a host buffer, check bytes
// =============================================================================
//
// COMMAND SEQUENCE (one command buffer, one submit):
// ┌──────────────────────────────────────────────────────────────────────┐
// │ barrier   UNDEFINED -> TRANSFER_DST_OPTIMAL                          │
// │ clear     image = CLEAR_COLOR                                        │
// │ barrier   TRANSFER_DST_OPTIMAL -> TRANSFER_SRC_OPTIMAL               │
// │ copy      image -> buffer (offset 0, rows of `width` texels)         │
// └──────────────────────────────────────────────────────────────────────┘
//
// After the fence signals, the buffer is mapped and every texel compared
// against the expected clear value.

use crate::backend::{AllocationStrategy, DeviceImage, HostBuffer, TransferSync, VulkanDevice};
use crate::report::TransferReport;
use crate::scenario::{Scenario, CLEAR_COLOR, PROBE_TEXELS};
use crate::texel::{read_texels, Rgb16};
use anyhow::Result;
use ash::vk;
use std::sync::Arc;

/// Result of comparing one probe texel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub index: usize,
    /// `None` when the texel lies beyond the readback data
    pub found: Option<Rgb16>,
    pub matches: bool,
}

/// A texel that differs from the expected value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub index: usize,
    pub x: u32,
    pub y: u32,
    pub found: Option<Rgb16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub expected: Rgb16,
    pub probes: Vec<Probe>,
    pub texels_checked: usize,
    pub mismatches: usize,
    /// First `max_reported` mismatches in buffer order
    pub first_mismatches: Vec<Mismatch>,
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        self.mismatches == 0 && self.probes.iter().all(|p| p.matches)
    }
}

/// Run one scenario end to end on `device`
pub fn run_scenario(
    device: &Arc<VulkanDevice>,
    scenario: &Scenario,
    strategy: AllocationStrategy,
    max_reported: usize,
) -> Result<TransferReport> {
    log::info!(
        "Scenario '{}': {}x{} {:?}, {:?} allocation",
        scenario.name,
        scenario.width,
        scenario.height,
        scenario.format(),
        strategy
    );

    device.check_transfer_support(scenario.width, scenario.height, scenario.format())?;

    let image = DeviceImage::new(
        device,
        strategy,
        scenario.format(),
        scenario.extent(),
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
    )?;

    let buffer = HostBuffer::new(
        device,
        strategy,
        scenario.buffer_size(),
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
    )?;
    log::debug!("Readback buffer: {} bytes", buffer.size);

    let sync = TransferSync::new(device)?;
    let cmd = sync.begin()?;
    record_clear_and_copy(&device.device, cmd, image.image, buffer.buffer, scenario);
    sync.submit_and_wait(device.queue)?;
    log::debug!("Transfer complete, reading back");

    let bytes = buffer.read_bytes()?;
    let verification = verify_texels(
        &bytes,
        scenario.width,
        scenario.expected_texel(),
        &PROBE_TEXELS,
        max_reported,
    );

    Ok(TransferReport {
        scenario: *scenario,
        device_name: device.device_name.clone(),
        strategy,
        verification,
    })
}

/// One pipeline barrier: source stages, destination stages, dependency flags
/// and the single image transition it carries
#[derive(Clone, Copy)]
pub struct LayoutBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dependency: vk::DependencyFlags,
    pub barrier: vk::ImageMemoryBarrier,
}

/// The single color mip/layer every command touches
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Transitions around the clear: [before clear, before copy]
pub fn layout_barriers(image: vk::Image) -> [LayoutBarrier; 2] {
    let subresource_range = color_subresource_range();

    let to_transfer_dst = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range)
        .build();

    let to_transfer_src = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range)
        .build();

    [
        LayoutBarrier {
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dependency: vk::DependencyFlags::BY_REGION,
            barrier: to_transfer_dst,
        },
        LayoutBarrier {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            dependency: vk::DependencyFlags::BY_REGION,
            barrier: to_transfer_src,
        },
    ]
}

/// Record the clear + layout transitions + copy into `cmd`
pub fn record_clear_and_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    buffer: vk::Buffer,
    scenario: &Scenario,
) {
    let [before_clear, before_copy] = layout_barriers(image);
    let clear_color = vk::ClearColorValue {
        float32: CLEAR_COLOR,
    };
    let copy_region = copy_region(scenario);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            before_clear.src_stage,
            before_clear.dst_stage,
            before_clear.dependency,
            &[],
            &[],
            &[before_clear.barrier],
        );

        device.cmd_clear_color_image(
            cmd,
            image,
            before_clear.barrier.new_layout,
            &clear_color,
            &[color_subresource_range()],
        );

        device.cmd_pipeline_barrier(
            cmd,
            before_copy.src_stage,
            before_copy.dst_stage,
            before_copy.dependency,
            &[],
            &[],
            &[before_copy.barrier],
        );

        device.cmd_copy_image_to_buffer(
            cmd,
            image,
            before_copy.barrier.new_layout,
            buffer,
            &[copy_region],
        );
    }
}

/// Whole-image copy into a tightly packed buffer
pub fn copy_region(scenario: &Scenario) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: scenario.width,
        buffer_image_height: scenario.height,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: scenario.extent(),
    }
}

/// Compare readback bytes against `expected`.
///
/// `probes` are reported individually; every decoded texel counts towards
/// `mismatches`. A probe past the end of the data is a mismatch.
pub fn verify_texels(
    bytes: &[u8],
    width: u32,
    expected: Rgb16,
    probes: &[usize],
    max_reported: usize,
) -> Verification {
    let texels = read_texels(bytes);
    let width = width.max(1) as usize;

    let probes = probes
        .iter()
        .map(|&index| {
            let found = texels.get(index).copied();
            Probe {
                index,
                found,
                matches: found == Some(expected),
            }
        })
        .collect::<Vec<_>>();

    let mut mismatches = 0;
    let mut first_mismatches = Vec::new();
    for (index, &texel) in texels.iter().enumerate() {
        if texel == expected {
            continue;
        }
        mismatches += 1;
        if first_mismatches.len() < max_reported {
            first_mismatches.push(Mismatch {
                index,
                x: (index % width) as u32,
                y: (index / width) as u32,
                found: Some(texel),
            });
        }
    }

    // Probes beyond the data were never scanned above
    for probe in probes.iter().filter(|p| p.found.is_none()) {
        mismatches += 1;
        if first_mismatches.len() < max_reported {
            first_mismatches.push(Mismatch {
                index: probe.index,
                x: (probe.index % width) as u32,
                y: (probe.index / width) as u32,
                found: None,
            });
        }
    }

    Verification {
        expected,
        probes,
        texels_checked: texels.len(),
        mismatches,
        first_mismatches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::scenario::{SQUARE, WIDE};
    use crate::texel::TEXEL_SIZE;
    use ash::vk::Handle;

    const RED: Rgb16 = Rgb16([0xFFFF, 0, 0]);

    fn buffer_of(texels: &[Rgb16]) -> Vec<u8> {
        texels
            .iter()
            .flat_map(|t| t.0.iter().flat_map(|c| c.to_le_bytes()))
            .collect()
    }

    #[test]
    fn uniform_red_buffer_passes() {
        let bytes = buffer_of(&vec![RED; WIDE.texel_count()]);

        let result = verify_texels(&bytes, WIDE.width, RED, &PROBE_TEXELS, 8);

        assert!(result.is_ok());
        assert_eq!(result.texels_checked, 10924);
        assert!(result.probes.iter().all(|p| p.found == Some(RED)));
    }

    #[test]
    fn corrupted_second_texel_fails_probe() {
        let mut texels = vec![RED; 16];
        texels[1] = Rgb16([0, 0, 0xFFFF]);
        let bytes = buffer_of(&texels);

        let result = verify_texels(&bytes, 8, RED, &PROBE_TEXELS, 8);

        assert!(!result.is_ok());
        assert!(result.probes[0].matches);
        assert!(!result.probes[1].matches);
        assert!(result.probes[2].matches);
        assert_eq!(result.mismatches, 1);
        assert_eq!(
            result.first_mismatches,
            vec![Mismatch { index: 1, x: 1, y: 0, found: Some(Rgb16([0, 0, 0xFFFF])) }]
        );
    }

    #[test]
    fn mismatch_outside_probes_still_fails() {
        let mut texels = vec![RED; 20];
        texels[13] = Rgb16([0, 0, 0]);
        let bytes = buffer_of(&texels);

        let result = verify_texels(&bytes, 10, RED, &PROBE_TEXELS, 8);

        assert!(result.probes.iter().all(|p| p.matches));
        assert!(!result.is_ok());
        assert_eq!(result.first_mismatches[0].x, 3);
        assert_eq!(result.first_mismatches[0].y, 1);
    }

    #[test]
    fn reported_mismatches_are_capped() {
        let bytes = vec![0u8; 100 * TEXEL_SIZE];

        let result = verify_texels(&bytes, 10, RED, &PROBE_TEXELS, 4);

        assert_eq!(result.mismatches, 100);
        assert_eq!(result.first_mismatches.len(), 4);
        assert_eq!(result.first_mismatches[3].index, 3);
    }

    #[test]
    fn short_buffer_fails_missing_probes() {
        let bytes = buffer_of(&[RED]);

        let result = verify_texels(&bytes, 4, RED, &PROBE_TEXELS, 8);

        assert!(!result.is_ok());
        assert_eq!(result.probes[1].found, None);
        assert_eq!(result.mismatches, 2);
        assert!(result.first_mismatches.iter().all(|m| m.found.is_none()));
    }

    #[test]
    fn copy_region_covers_whole_image() {
        let region = copy_region(&WIDE);

        assert_eq!(region.buffer_offset, 0);
        assert_eq!(region.buffer_row_length, 5462);
        assert_eq!(region.buffer_image_height, 2);
        assert_eq!(region.image_extent.width, 5462);
        assert_eq!(region.image_extent.height, 2);
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.image_subresource.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    fn assert_whole_color_range(range: vk::ImageSubresourceRange) {
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(range.base_mip_level, 0);
        assert_eq!(range.level_count, 1);
        assert_eq!(range.base_array_layer, 0);
        assert_eq!(range.layer_count, 1);
    }

    #[test]
    fn first_barrier_moves_undefined_image_to_transfer_dst() {
        let image = vk::Image::from_raw(0x1234);
        let [before_clear, _] = layout_barriers(image);

        assert_eq!(before_clear.src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(before_clear.dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(before_clear.dependency, vk::DependencyFlags::BY_REGION);

        let b = before_clear.barrier;
        assert_eq!(b.s_type, vk::StructureType::IMAGE_MEMORY_BARRIER);
        assert_eq!(b.src_access_mask, vk::AccessFlags::empty());
        assert_eq!(b.dst_access_mask, vk::AccessFlags::empty());
        assert_eq!(b.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(b.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(b.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.image, image);
        assert_whole_color_range(b.subresource_range);
    }

    #[test]
    fn second_barrier_makes_cleared_image_a_copy_source() {
        let image = vk::Image::from_raw(0x1234);
        let [_, before_copy] = layout_barriers(image);

        assert_eq!(before_copy.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(before_copy.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(before_copy.dependency, vk::DependencyFlags::BY_REGION);

        let b = before_copy.barrier;
        assert_eq!(b.s_type, vk::StructureType::IMAGE_MEMORY_BARRIER);
        assert_eq!(b.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(b.dst_access_mask, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(b.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(b.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(b.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.image, image);
        assert_whole_color_range(b.subresource_range);
    }

    #[test]
    fn barriers_chain_layouts() {
        let [before_clear, before_copy] = layout_barriers(vk::Image::null());
        assert_eq!(before_clear.barrier.new_layout, before_copy.barrier.old_layout);
    }

    // Needs a Vulkan driver: cargo test -- --ignored
    #[test]
    #[ignore = "requires a Vulkan-capable GPU"]
    fn square_control_transfer_on_real_gpu() {
        let config = DeviceConfig {
            validation_layers: false,
            ..Default::default()
        };
        let device = VulkanDevice::new("transfer-probe-test", &config).unwrap();

        let report = run_scenario(&device, &SQUARE, AllocationStrategy::Dedicated, 8).unwrap();

        assert_eq!(report.verification.texels_checked, SQUARE.texel_count());
        assert!(report.passed(), "control scenario failed:\n{}", report);
    }
}
