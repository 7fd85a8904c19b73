// Tests for the pieces that run without a live GPU: the step
// optimizer, cursor arithmetic, capability parsing, format
// conversion, descriptor dedup bookkeeping and the pipeline cache
// file format.

use crate::caps::{vulkan_bug_pass, DeviceBugs, GpuVendor};
use crate::descriptor::{dedups_against_previous, PackedDescriptor, PendingDescSet};
use crate::format::{self, DataFormat};
use crate::glcaps;
use crate::memory::ChunkCursor;
use crate::optimize::{preprocess_steps, QueueHacks};
use crate::pipeline::{
    load_cache, merge_rp_types, save_cache, validate_raw_blob, Promise, RasterStateKey,
    RenderPassType, StoredPipelineKey,
};
use crate::resource::Framebuffer;
use crate::step::{
    cleanup_render_commands, remove_draw_commands, stamp_final_layout_backwards, BoundingRect,
    CopyStep, LoadAction, PipelineFlags, RenderCommand, RenderStep, Step, StepKind, StoreAction,
    TransitionRequest,
};

use ash::vk;
use std::sync::Arc;

fn test_fb(width: u32, height: u32, with_depth: bool, tag: &str) -> Arc<Framebuffer> {
    Framebuffer::new(
        width,
        height,
        1,
        vk::SampleCountFlags::TYPE_1,
        with_depth,
        vk::Format::R8G8B8A8_UNORM,
        vk::Format::D24_UNORM_S8_UINT,
        tag,
    )
}

fn draw_command() -> RenderCommand {
    RenderCommand::Draw {
        desc_set_index: 0,
        ubo_offsets: [0; 3],
        num_ubo_offsets: 0,
        vbuffer: vk::Buffer::null(),
        voffset: 0,
        count: 3,
        offset: 0,
    }
}

fn render_step(
    fb: &Arc<Framebuffer>,
    loads: (LoadAction, LoadAction, LoadAction),
    draws: u32,
) -> Step {
    let mut commands = Vec::new();
    for _ in 0..draws {
        commands.push(draw_command());
    }
    Step::new_render(
        "test",
        RenderStep {
            framebuffer: Some(fb.clone()),
            color_load: loads.0,
            depth_load: loads.1,
            stencil_load: loads.2,
            color_store: StoreAction::Store,
            depth_store: StoreAction::Store,
            stencil_store: StoreAction::Store,
            clear_color: 0,
            clear_depth: 0.0,
            clear_stencil: 0,
            num_draws: draws,
            num_reads: 0,
            final_color_layout: vk::ImageLayout::UNDEFINED,
            final_depth_layout: vk::ImageLayout::UNDEFINED,
            pipeline_flags: PipelineFlags::empty(),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: fb.fb_width,
                    height: fb.fb_height,
                },
            },
            render_pass_type: RenderPassType::DEFAULT,
            pre_transitions: Vec::new(),
            commands,
        },
    )
}

fn copy_step(src: &Arc<Framebuffer>, dst: &Arc<Framebuffer>) -> Step {
    Step {
        tag: "copy",
        dependencies: vec![src.fb_id],
        kind: StepKind::Copy(CopyStep {
            src: src.clone(),
            dst: dst.clone(),
            src_rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: src.fb_width,
                    height: src.fb_height,
                },
            },
            dst_pos: vk::Offset2D { x: 0, y: 0 },
            aspect: vk::ImageAspectFlags::COLOR,
        }),
    }
}

// ---------------------------------------------------------------------
// Format utilities

#[test]
fn format_sizes() {
    assert_eq!(DataFormat::R8G8B8A8Unorm.size_in_bytes(), 4);
    assert_eq!(DataFormat::R5G6B5UnormPack16.size_in_bytes(), 2);
    assert_eq!(DataFormat::D24S8.size_in_bytes(), 4);
    assert_eq!(DataFormat::D32FS8.size_in_bytes(), 5);
    assert!(DataFormat::D24S8.is_depth_stencil());
    assert!(!DataFormat::R8G8B8A8Unorm.is_depth_stencil());
    assert_eq!(DataFormat::Bc1RgbaUnormBlock.block_size_in_bytes(), Some(8));
    assert_eq!(DataFormat::Bc7UnormBlock.block_size_in_bytes(), Some(16));
    assert_eq!(DataFormat::Bc1RgbaUnormBlock.block_dimensions(), (4, 4));
    assert_eq!(DataFormat::R8Unorm.block_dimensions(), (1, 1));
}

#[test]
fn convert_rgba_passthrough_and_swap() {
    // The byte order a clear to 0xFF336699 produces in an RGBA8
    // attachment: R=0x99, G=0x66, B=0x33, A=0xFF.
    let src = [0x99u8, 0x66, 0x33, 0xFF, 0x99, 0x66, 0x33, 0xFF];
    let mut dst = [0u8; 8];
    format::convert_from_rgba8888(&mut dst, &src, 2, 2, 2, 1, DataFormat::R8G8B8A8Unorm).unwrap();
    assert_eq!(dst, src);

    format::convert_from_rgba8888(&mut dst, &src, 2, 2, 2, 1, DataFormat::B8G8R8A8Unorm).unwrap();
    assert_eq!(&dst[..4], &[0x33, 0x66, 0x99, 0xFF]);

    // And the BGRA entry point swaps back.
    let mut dst2 = [0u8; 8];
    format::convert_from_bgra8888(&mut dst2, &dst, 2, 2, 2, 1, DataFormat::R8G8B8A8Unorm).unwrap();
    assert_eq!(dst2, src);
}

#[test]
fn convert_rgba_to_565() {
    let src = [0xFFu8, 0x00, 0x00, 0xFF]; // pure red
    let mut dst = [0u8; 2];
    format::convert_from_rgba8888(&mut dst, &src, 1, 1, 1, 1, DataFormat::R5G6B5UnormPack16)
        .unwrap();
    assert_eq!(u16::from_le_bytes(dst), 0xF800);

    let src = [0x00u8, 0xFF, 0x00, 0xFF]; // pure green
    format::convert_from_rgba8888(&mut dst, &src, 1, 1, 1, 1, DataFormat::R5G6B5UnormPack16)
        .unwrap();
    assert_eq!(u16::from_le_bytes(dst), 0x07E0);
}

#[test]
fn convert_rgba_strided() {
    // 1x2 source inside a stride-4 buffer, converted to a stride-2
    // destination.
    let mut src = [0u8; 4 * 4 * 2];
    src[0..4].copy_from_slice(&[1, 2, 3, 4]);
    src[16..20].copy_from_slice(&[5, 6, 7, 8]);
    let mut dst = [0u8; 2 * 4 * 2];
    format::convert_from_rgba8888(&mut dst, &src, 2, 4, 1, 2, DataFormat::R8G8B8A8Unorm).unwrap();
    assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
    assert_eq!(&dst[8..12], &[5, 6, 7, 8]);
}

#[test]
fn convert_depth_formats() {
    // D24S8 depth-aspect readbacks pack the depth value into the low
    // 24 bits of each word; the top byte is unspecified.
    let word: u32 = 0xAB00_0000 | 0x0012_3456;
    let src = word.to_le_bytes();
    let mut d16 = [0u8; 2];
    format::convert_to_d16(&mut d16, &src, 1, 1, 1, 1, DataFormat::D24S8).unwrap();
    assert_eq!(u16::from_le_bytes(d16), 0x1234);

    // D16 -> D32F: full range maps to 1.0.
    let src = 0xFFFFu16.to_le_bytes();
    let mut d32 = [0u8; 4];
    format::convert_to_d32f(&mut d32, &src, 1, 1, 1, 1, DataFormat::D16).unwrap();
    assert!((f32::from_le_bytes(d32) - 1.0).abs() < 1e-6);

    // D32F -> D16 truncation.
    let src = 0.5f32.to_le_bytes();
    let mut d16 = [0u8; 2];
    format::convert_to_d16(&mut d16, &src, 1, 1, 1, 1, DataFormat::D32F).unwrap();
    assert_eq!(u16::from_le_bytes(d16), 32767);
}

// ---------------------------------------------------------------------
// Capability probing

#[test]
fn gl_version_parsing() {
    assert_eq!(glcaps::parse_gl_version("4.6.0 NVIDIA 535.129.03"), (4, 6));
    assert_eq!(glcaps::parse_gl_version("OpenGL ES 3.2 v1.r26p0-01rel0"), (3, 2));
    assert_eq!(glcaps::parse_gl_version("OpenGL ES 2.0"), (2, 0));
    assert_eq!(glcaps::parse_gl_version("nonsense"), (2, 0));
    assert!(glcaps::is_gles_version_string("OpenGL ES 3.0 build 1.10"));
    assert!(!glcaps::is_gles_version_string("4.5.0 Core Profile"));
}

#[test]
fn gl_vendor_parsing() {
    assert_eq!(
        glcaps::parse_gl_vendor("NVIDIA Corporation", "GeForce GTX 970"),
        (GpuVendor::Nvidia, 0)
    );
    assert_eq!(
        glcaps::parse_gl_vendor("Qualcomm", "Adreno (TM) 640"),
        (GpuVendor::Qualcomm, 640)
    );
    // Unparseable Adreno model defaults to 300.
    assert_eq!(
        glcaps::parse_gl_vendor("Qualcomm", "Adreno (TM) weird"),
        (GpuVendor::Qualcomm, 300)
    );
    assert_eq!(
        glcaps::parse_gl_vendor("Imagination Technologies", "PowerVR SGX 540"),
        (GpuVendor::Imgtec, 0)
    );
}

#[test]
fn pvr_precision_rules() {
    let gl = glcaps::probe_from_strings(
        "OpenGL ES 2.0",
        "Imagination Technologies",
        "PowerVR SGX 540",
        "",
        false,
    );
    assert!(gl.bugs.contains(DeviceBugs::PVR_SHADER_PRECISION_TERRIBLE));
    assert!(gl.bugs.contains(DeviceBugs::PVR_SHADER_PRECISION_BAD));

    let gl = glcaps::probe_from_strings(
        "OpenGL ES 3.2",
        "Imagination Technologies",
        "PowerVR Rogue GE8320",
        "",
        false,
    );
    assert!(!gl.bugs.contains(DeviceBugs::PVR_SHADER_PRECISION_TERRIBLE));
    assert!(gl.bugs.contains(DeviceBugs::PVR_SHADER_PRECISION_BAD));
}

#[test]
fn gl_bug_pass_rules() {
    // Sub-3.0 contexts get dual source blending disabled outright.
    let gl = glcaps::probe_from_strings("OpenGL ES 2.0", "ARM", "Mali-400", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "", None, false, false);
    assert!(bugs.contains(DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN));
    assert!(bugs.contains(DeviceBugs::ANY_MAP_BUFFER_RANGE_SLOW));

    // Vivante can't do NaN in conditionals.
    let gl = glcaps::probe_from_strings("OpenGL ES 3.0", "Vivante Corporation", "GC2000", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "", None, false, false);
    assert!(bugs.contains(DeviceBugs::BROKEN_NAN_IN_CONDITIONAL));

    // Intel build number window for the dual source bug.
    let gl = glcaps::probe_from_strings("4.3.0 - Build 10.18.10.4000", "Intel", "HD 4600", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "Build 10.18.10.4000", None, false, false);
    assert!(bugs.contains(DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN));
    let bugs = glcaps::gl_bug_pass(&gl, "Build 10.18.10.4061", None, false, false);
    assert!(!bugs.contains(DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN));

    // Adreno resource deadlock appeared with Android 8.0 on 3xx/5xx.
    let gl = glcaps::probe_from_strings("OpenGL ES 3.2", "Qualcomm", "Adreno (TM) 540", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "", Some(26), false, false);
    assert!(bugs.contains(DeviceBugs::ADRENO_RESOURCE_DEADLOCK));
    let gl = glcaps::probe_from_strings("OpenGL ES 3.2", "Qualcomm", "Adreno (TM) 640", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "", Some(26), false, false);
    assert!(!bugs.contains(DeviceBugs::ADRENO_RESOURCE_DEADLOCK));
}

#[test]
fn buffer_strategy_selection() {
    let gl = glcaps::probe_from_strings("4.6.0 NVIDIA", "NVIDIA Corporation", "GTX 970", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "", None, false, false);
    assert_eq!(
        glcaps::select_buffer_strategy(&gl, bugs),
        glcaps::BufferStrategy::FrameUnmap
    );

    // Mapping murders performance on Mali, so subdata it is.
    let gl = glcaps::probe_from_strings("OpenGL ES 3.2", "ARM", "Mali-G76", "", false);
    let bugs = glcaps::gl_bug_pass(&gl, "", None, false, false);
    assert_eq!(
        glcaps::select_buffer_strategy(&gl, bugs),
        glcaps::BufferStrategy::Subdata
    );

    assert!(glcaps::BufferStrategy::FlushInvalidateUnmap.wants_explicit_flush());
    assert!(glcaps::BufferStrategy::FlushInvalidateUnmap.wants_invalidate());
    assert!(!glcaps::BufferStrategy::Subdata.wants_mapping());
}

#[test]
fn vulkan_bug_rules() {
    // Adreno 5xx with an old driver fails stencil discard.
    let bugs = vulkan_bug_pass(GpuVendor::Qualcomm, 0x0501_2345, 0x8017_0000);
    assert!(bugs.contains(DeviceBugs::NO_DEPTH_CANNOT_DISCARD_STENCIL));
    assert!(bugs.contains(DeviceBugs::COLORWRITEMASK_BROKEN_WITH_DEPTHTEST));

    // Fixed driver keeps the colormask bug only.
    let bugs = vulkan_bug_pass(GpuVendor::Qualcomm, 0x0501_2345, 0x8018_0000);
    assert!(!bugs.contains(DeviceBugs::NO_DEPTH_CANNOT_DISCARD_STENCIL));
    assert!(bugs.contains(DeviceBugs::COLORWRITEMASK_BROKEN_WITH_DEPTHTEST));

    let bugs = vulkan_bug_pass(GpuVendor::Amd, 0, 0x0040_6FFF);
    assert!(bugs.contains(DeviceBugs::DUAL_SOURCE_BLENDING_BROKEN));
    let bugs = vulkan_bug_pass(GpuVendor::Amd, 0, 0x0040_7000);
    assert!(bugs.is_empty());

    let bugs = vulkan_bug_pass(GpuVendor::Arm, 0, 0);
    assert!(bugs.contains(DeviceBugs::EQUAL_WZ_CORRUPTS_DEPTH));
    assert!(bugs.contains(DeviceBugs::MALI_STENCIL_DISCARD_BUG));
}

// ---------------------------------------------------------------------
// Push buffer cursor

#[test]
fn push_cursor_chunk_growth() {
    let mut cursor = ChunkCursor::new(1024);

    let a = cursor.allocate(600, 16);
    assert_eq!((a.chunk, a.offset), (0, 0));
    assert!(a.new_chunk.is_none());

    // 600 aligned to 16 is 608; 608 + 600 overflows the chunk, so
    // this lands at the start of a fresh one.
    let b = cursor.allocate(600, 16);
    assert_eq!((b.chunk, b.offset), (1, 0));
    assert_eq!(b.new_chunk, Some(1024));
    assert_eq!(cursor.chunks.len(), 2);

    let grown = cursor.defragment();
    assert_eq!(grown, Some(2048));
    assert!(cursor.total_size() >= 1200);
    assert_eq!(cursor.chunks.len(), 1);
    assert_eq!(cursor.offset, 0);
}

#[test]
fn push_cursor_alignment_contract() {
    let mut cursor = ChunkCursor::new(4096);
    let sizes = [(13usize, 4usize), (100, 16), (1, 4), (255, 64), (32, 256)];

    let mut prev_end = 0usize;
    for (size, align) in sizes.iter() {
        let alloc = cursor.allocate(*size, *align);
        assert_eq!(alloc.offset % align, 0, "offset must honor alignment");
        assert!(alloc.offset >= prev_end, "allocations must not overlap");
        prev_end = alloc.offset + size;
    }
}

#[test]
fn push_cursor_oversized_allocation() {
    let mut cursor = ChunkCursor::new(1024);
    let a = cursor.allocate(5000, 4);
    // The chunk grows to fit rather than failing.
    assert_eq!(a.new_chunk, Some(5000));
    assert_eq!(a.offset, 0);
}

// ---------------------------------------------------------------------
// Step optimizer

#[test]
fn final_layouts_filled() {
    let fb = test_fb(64, 64, true, "fb");
    let mut steps = vec![render_step(&fb, (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep), 1)];
    preprocess_steps(&mut steps, QueueHacks::empty());

    let r = steps[0].render().unwrap();
    assert_eq!(r.final_color_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(
        r.final_depth_layout,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    );
}

#[test]
fn clear_hoisting() {
    let fb = test_fb(128, 128, true, "target");

    let mut clear = render_step(
        &fb,
        (LoadAction::Clear, LoadAction::Clear, LoadAction::Clear),
        0,
    );
    if let StepKind::Render(r) = &mut clear.kind {
        r.clear_color = 0xFF33_6699;
        r.clear_depth = 1.0;
        r.clear_stencil = 7;
    }
    let draw = render_step(&fb, (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep), 1);

    let mut steps = vec![clear, draw];
    preprocess_steps(&mut steps, QueueHacks::empty());

    assert!(matches!(steps[0].kind, StepKind::RenderSkip));
    let r = steps[1].render().unwrap();
    assert_eq!(r.color_load, LoadAction::Clear);
    assert_eq!(r.depth_load, LoadAction::Clear);
    assert_eq!(r.stencil_load, LoadAction::Clear);
    assert_eq!(r.clear_color, 0xFF33_6699);
    assert_eq!(r.clear_stencil, 7);
    assert_eq!(r.num_draws, 1);

    // The merged render area must stay inside the framebuffer.
    assert!(r.render_area.offset.x >= 0 && r.render_area.offset.y >= 0);
    assert!(r.render_area.offset.x as u32 + r.render_area.extent.width <= fb.fb_width);
    assert!(r.render_area.offset.y as u32 + r.render_area.extent.height <= fb.fb_height);
}

#[test]
fn clear_hoisting_blocked_by_copy() {
    let fb = test_fb(64, 64, false, "target");
    let other = test_fb(64, 64, false, "other");

    let clear = render_step(
        &fb,
        (LoadAction::Clear, LoadAction::Clear, LoadAction::Clear),
        0,
    );
    // A copy into the framebuffer pins the clear where it is.
    let copy = copy_step(&other, &fb);
    let draw = render_step(&fb, (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep), 1);

    let mut steps = vec![clear, copy, draw];
    preprocess_steps(&mut steps, QueueHacks::empty());

    assert!(matches!(steps[0].kind, StepKind::Render(_)));
    assert_eq!(steps[2].render().unwrap().color_load, LoadAction::Keep);
}

#[test]
fn mgs_hack_reorders_copies_before_renders() {
    let copy_src = test_fb(32, 32, false, "depal-src");
    let copy_dst = test_fb(32, 32, false, "depal-dst");
    let target = test_fb(256, 256, false, "target");

    // copy,render(1),copy,render(1),copy,render(1) becomes
    // copy,copy,copy,render(3).
    let mut steps = vec![
        copy_step(&copy_src, &copy_dst),
        render_step(&target, (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep), 1),
        copy_step(&copy_src, &copy_dst),
        render_step(&target, (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep), 1),
        copy_step(&copy_src, &copy_dst),
        render_step(&target, (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep), 1),
    ];
    preprocess_steps(&mut steps, QueueHacks::MGS2_ACID);

    assert!(matches!(steps[0].kind, StepKind::Copy(_)));
    assert!(matches!(steps[1].kind, StepKind::Copy(_)));
    assert!(matches!(steps[2].kind, StepKind::Copy(_)));
    let r = steps[3].render().unwrap();
    assert_eq!(r.commands.len(), 3);
    assert!(matches!(steps[4].kind, StepKind::RenderSkip));
    assert!(matches!(steps[5].kind, StepKind::RenderSkip));
}

#[test]
fn sonic_hack_partitions_by_target() {
    let fb_a = test_fb(64, 64, false, "a");
    let fb_b = test_fb(64, 64, false, "b");
    let keep = (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep);

    let mut steps = vec![
        render_step(&fb_a, keep, 3),
        render_step(&fb_b, keep, 1),
        render_step(&fb_a, keep, 6),
        render_step(&fb_b, keep, 1),
        render_step(&fb_a, keep, 6),
        render_step(&fb_b, keep, 1),
    ];
    preprocess_steps(&mut steps, QueueHacks::SONIC);

    // All the A renders merge into one pass, then all the B renders.
    let a = steps[0].render().unwrap();
    assert!(Arc::ptr_eq(a.framebuffer.as_ref().unwrap(), &fb_a));
    assert_eq!(a.commands.len(), 15);
    assert!(matches!(steps[1].kind, StepKind::RenderSkip));
    assert!(matches!(steps[2].kind, StepKind::RenderSkip));
    let b = steps[3].render().unwrap();
    assert!(Arc::ptr_eq(b.framebuffer.as_ref().unwrap(), &fb_b));
    assert_eq!(b.commands.len(), 3);
    assert!(matches!(steps[4].kind, StepKind::RenderSkip));
    assert!(matches!(steps[5].kind, StepKind::RenderSkip));
}

#[test]
fn render_pass_merge_absorbs_compatible_passes() {
    let fb = test_fb(64, 64, false, "main");
    let other = test_fb(64, 64, false, "other");
    let keep = (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep);

    let mut steps = vec![
        render_step(&fb, keep, 1),
        render_step(&other, keep, 1),
        render_step(&fb, keep, 2),
    ];
    preprocess_steps(&mut steps, QueueHacks::RENDERPASS_MERGE);

    let r = steps[0].render().unwrap();
    assert_eq!(r.num_draws, 3);
    assert!(matches!(steps[2].kind, StepKind::RenderSkip));

    // Property: after merging, adjacent render steps to the same
    // framebuffer leave at most one non-skip.
    let non_skip_to_fb = steps
        .iter()
        .filter(|s| {
            s.render()
                .map(|r| r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb.fb_id))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(non_skip_to_fb, 1);
}

#[test]
fn render_pass_merge_blocked_by_dependency() {
    let fb = test_fb(64, 64, false, "main");
    let other = test_fb(64, 64, false, "sampler-target");
    let keep = (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep);

    // The middle pass samples from fb, so the two fb passes must not
    // merge across it.
    let mut middle = render_step(&other, keep, 1);
    middle.add_dependency(fb.fb_id);

    let mut steps = vec![
        render_step(&fb, keep, 1),
        middle,
        render_step(&fb, keep, 1),
    ];
    preprocess_steps(&mut steps, QueueHacks::RENDERPASS_MERGE);

    assert!(matches!(steps[2].kind, StepKind::Render(_)));
    assert_eq!(steps[0].render().unwrap().num_draws, 1);
}

#[test]
fn render_pass_merge_blocked_by_clear() {
    let fb = test_fb(64, 64, false, "main");
    let keep = (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep);

    let mut steps = vec![
        render_step(&fb, keep, 1),
        render_step(
            &fb,
            (LoadAction::Clear, LoadAction::Keep, LoadAction::Keep),
            1,
        ),
    ];
    preprocess_steps(&mut steps, QueueHacks::RENDERPASS_MERGE);

    // A clear mid-merge would change results; both passes stay.
    assert!(matches!(steps[1].kind, StepKind::Render(_)));
}

#[test]
fn bind_as_texture_back_stamping() {
    let fb = test_fb(64, 64, true, "f");
    let other = test_fb(64, 64, false, "g");
    let keep = (LoadAction::Keep, LoadAction::Keep, LoadAction::Keep);

    let mut steps = vec![render_step(&fb, keep, 1), render_step(&other, keep, 0)];

    // What BindFramebufferAsTexture does under the hood: stamp the
    // last writer's final layout and register a pre-transition.
    stamp_final_layout_backwards(
        &mut steps,
        fb.fb_id,
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        true,
    );
    if let StepKind::Render(r) = &mut steps[1].kind {
        r.add_pre_transition(TransitionRequest {
            fb: fb.clone(),
            aspect: vk::ImageAspectFlags::COLOR,
            target_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
        // Duplicate requests collapse.
        r.add_pre_transition(TransitionRequest {
            fb: fb.clone(),
            aspect: vk::ImageAspectFlags::COLOR,
            target_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
    }

    let writer = steps[0].render().unwrap();
    assert_eq!(
        writer.final_color_layout,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
    assert_eq!(writer.num_reads, 1);

    let reader = steps[1].render().unwrap();
    assert_eq!(reader.pre_transitions.len(), 1);
    assert_eq!(
        reader.pre_transitions[0].target_layout,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );

    // An already-decided layout is left alone.
    stamp_final_layout_backwards(
        &mut steps,
        fb.fb_id,
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        false,
    );
    assert_eq!(
        steps[0].render().unwrap().final_color_layout,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
}

#[test]
fn command_cleanup() {
    let vp = RenderCommand::Viewport {
        vp: vk::Viewport::default(),
    };
    let sc = RenderCommand::Scissor {
        rc: vk::Rect2D::default(),
    };

    let mut cmds = vec![vp.clone(), sc.clone(), vp.clone(), draw_command(), sc.clone()];
    cleanup_render_commands(&mut cmds);

    // First viewport superseded before the draw, trailing scissor
    // never consumed.
    assert!(matches!(cmds[0], RenderCommand::Removed));
    assert!(matches!(cmds[1], RenderCommand::Scissor { .. }));
    assert!(matches!(cmds[2], RenderCommand::Viewport { .. }));
    assert!(matches!(cmds[3], RenderCommand::Draw { .. }));
    assert!(matches!(cmds[4], RenderCommand::Removed));
}

#[test]
fn draw_removal() {
    let mut cmds = vec![
        draw_command(),
        RenderCommand::Viewport {
            vp: vk::Viewport::default(),
        },
        draw_command(),
    ];
    remove_draw_commands(&mut cmds);
    assert!(matches!(cmds[0], RenderCommand::Removed));
    assert!(matches!(cmds[1], RenderCommand::Viewport { .. }));
    assert!(matches!(cmds[2], RenderCommand::Removed));
}

#[test]
fn rp_type_merging() {
    assert_eq!(
        merge_rp_types(RenderPassType::DEFAULT, RenderPassType::HAS_DEPTH),
        RenderPassType::HAS_DEPTH
    );
    assert_eq!(
        merge_rp_types(
            RenderPassType::HAS_DEPTH | RenderPassType::MULTISAMPLE,
            RenderPassType::HAS_DEPTH
        ),
        RenderPassType::HAS_DEPTH | RenderPassType::MULTISAMPLE
    );
    let bb = RenderPassType::BACKBUFFER | RenderPassType::HAS_DEPTH;
    assert_eq!(merge_rp_types(bb, bb), bb);
}

#[test]
fn bounding_rect_accumulation() {
    let mut rect = BoundingRect::new();
    assert!(rect.is_empty());

    rect.apply(&vk::Rect2D {
        offset: vk::Offset2D { x: 10, y: 20 },
        extent: vk::Extent2D {
            width: 30,
            height: 30,
        },
    });
    rect.apply(&vk::Rect2D {
        offset: vk::Offset2D { x: 5, y: 40 },
        extent: vk::Extent2D {
            width: 10,
            height: 40,
        },
    });
    assert!(!rect.is_empty());

    let r = rect.to_rect2d();
    assert_eq!(r.offset.x, 5);
    assert_eq!(r.offset.y, 20);
    assert_eq!(r.offset.x + r.extent.width as i32, 40);
    assert_eq!(r.offset.y + r.extent.height as i32, 80);
}

// ---------------------------------------------------------------------
// Descriptor dedup

#[test]
fn descriptor_dedup_counts() {
    let view = vk::ImageView::null();
    let sampler = vk::Sampler::null();
    let image = PackedDescriptor::Image { view, sampler };

    // Four identical adjacent sets: the first allocates, the other
    // three dedup.
    let desc_data = vec![image, image, image, image];
    let desc_sets: Vec<PendingDescSet> = (0..4)
        .map(|i| PendingDescSet {
            offset: i,
            count: 1,
            set: vk::DescriptorSet::null(),
        })
        .collect();

    let mut dedups = 0;
    for i in 0..desc_sets.len() {
        if dedups_against_previous(&desc_data, &desc_sets, 0, i) {
            dedups += 1;
        }
    }
    assert_eq!(dedups, 3);

    // A different descriptor breaks the chain.
    let desc_data = vec![
        image,
        PackedDescriptor::Buffer {
            buffer: vk::Buffer::null(),
            offset: 64,
            range: 16,
        },
    ];
    let desc_sets: Vec<PendingDescSet> = (0..2)
        .map(|i| PendingDescSet {
            offset: i,
            count: 1,
            set: vk::DescriptorSet::null(),
        })
        .collect();
    assert!(!dedups_against_previous(&desc_data, &desc_sets, 0, 1));
}

// ---------------------------------------------------------------------
// Pipeline cache file format

fn sample_keys() -> Vec<StoredPipelineKey> {
    let mut raster = RasterStateKey::default();
    raster.blend_enable = 1;
    raster.depth_test_enable = 1;
    raster.depth_compare_op = 3;

    vec![
        StoredPipelineKey {
            raster,
            vertex_shader_id: [1, 2, 3, 4],
            fragment_shader_id: [5, 6, 7, 8],
            vtx_fmt_id: 42,
            variants: 0b11,
            use_hw_transform: 1,
        },
        StoredPipelineKey {
            raster: RasterStateKey::default(),
            vertex_shader_id: [9, 9, 9, 9],
            fragment_shader_id: [1, 1, 1, 1],
            vtx_fmt_id: 0,
            variants: 0b1,
            use_hw_transform: 0,
        },
    ]
}

#[test]
fn pipeline_cache_round_trip() {
    let keys = sample_keys();
    let uuid = [0u8; 16];

    let mut file = Vec::new();
    assert!(save_cache(&mut file, &keys, None));

    let (loaded, blob) = load_cache(&mut file.as_slice(), false, &uuid);
    assert_eq!(loaded, keys);
    assert!(blob.is_none());

    // Save -> load -> save must be byte identical.
    let mut file2 = Vec::new();
    assert!(save_cache(&mut file2, &loaded, None));
    assert_eq!(file, file2);
}

#[test]
fn pipeline_cache_rejects_bad_files() {
    let keys = sample_keys();
    let uuid = [0u8; 16];

    let mut file = Vec::new();
    save_cache(&mut file, &keys, None);

    // A version bump invalidates everything.
    let mut wrong_version = file.clone();
    wrong_version[0] ^= 0xFF;
    let (loaded, _) = load_cache(&mut wrong_version.as_slice(), false, &uuid);
    assert!(loaded.is_empty());

    // A short read yields a clean empty cache.
    let truncated = &file[..file.len() - 3];
    let (loaded, _) = load_cache(&mut &truncated[..], false, &uuid);
    assert!(loaded.is_empty());

    // Empty file.
    let (loaded, _) = load_cache(&mut &[][..], false, &uuid);
    assert!(loaded.is_empty());
}

#[test]
fn pipeline_cache_raw_blob_gating() {
    let device_uuid = [7u8; 16];

    // Construct a plausible driver header: size, version 1, vendor,
    // device, then the UUID.
    let mut blob = Vec::new();
    blob.extend_from_slice(&32u32.to_le_bytes());
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&0x10DEu32.to_le_bytes());
    blob.extend_from_slice(&0x2204u32.to_le_bytes());
    blob.extend_from_slice(&device_uuid);
    blob.extend_from_slice(&[0xAB; 100]);

    assert!(validate_raw_blob(&blob, &device_uuid));
    assert!(!validate_raw_blob(&blob, &[8u8; 16]));
    assert!(!validate_raw_blob(&blob[..10], &device_uuid));

    // End to end: the blob survives with the right UUID and is
    // silently discarded with the wrong one.
    let keys = sample_keys();
    let mut file = Vec::new();
    assert!(save_cache(&mut file, &keys, Some(&blob)));

    let (loaded, got_blob) = load_cache(&mut file.as_slice(), true, &device_uuid);
    assert_eq!(loaded, keys);
    assert_eq!(got_blob.unwrap(), blob);

    let (loaded, got_blob) = load_cache(&mut file.as_slice(), true, &[9u8; 16]);
    assert_eq!(loaded, keys);
    assert!(got_blob.is_none());
}

// ---------------------------------------------------------------------
// Barriers and promises

#[test]
fn layout_transition_table() {
    use crate::barrier::layout_transition_allowed;
    use vk::ImageLayout as L;

    assert!(layout_transition_allowed(L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL));
    assert!(layout_transition_allowed(
        L::COLOR_ATTACHMENT_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL
    ));
    assert!(layout_transition_allowed(
        L::SHADER_READ_ONLY_OPTIMAL,
        L::TRANSFER_SRC_OPTIMAL
    ));
    assert!(layout_transition_allowed(L::PRESENT_SRC_KHR, L::TRANSFER_SRC_OPTIMAL));
    assert!(layout_transition_allowed(
        L::TRANSFER_SRC_OPTIMAL,
        L::PRESENT_SRC_KHR
    ));

    // Write-after-write self barriers are only valid on writable
    // layouts.
    assert!(layout_transition_allowed(
        L::COLOR_ATTACHMENT_OPTIMAL,
        L::COLOR_ATTACHMENT_OPTIMAL
    ));
    assert!(!layout_transition_allowed(
        L::SHADER_READ_ONLY_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL
    ));

    assert!(!layout_transition_allowed(L::PRESENT_SRC_KHR, L::SHADER_READ_ONLY_OPTIMAL));
}

#[test]
fn promise_blocks_until_resolved() {
    let promise: Arc<Promise<u64>> = Promise::new_empty();
    assert_eq!(promise.try_get(), None);

    let resolver = promise.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        resolver.resolve(1234);
    });

    assert_eq!(promise.block_until_ready(), 1234);
    assert_eq!(promise.try_get(), Some(1234));
    handle.join().unwrap();

    let ready = Promise::new_ready(7u64);
    assert_eq!(ready.block_until_ready(), 7);
}
