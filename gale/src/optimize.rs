// Step-list optimization
//
// Runs once per frame between recording and execution, on whichever
// thread hands the list over. Steps are rewritten in place and
// neutralized by flipping them to RenderSkip so indices stay stable.

use ash::vk;

use crate::pipeline::merge_rp_types;
use crate::resource::ResourceId;
use crate::step::{
    merge_render_area_rect, LoadAction, RenderCommand, RenderStep, Step, StepKind,
};
use utils::log;

use std::collections::HashMap;

bitflags::bitflags! {
    /// Game-specific queue rewrites. Every one of these pattern
    /// matches a fragile step sequence, so they stay off unless the
    /// caller's compat database turns them on.
    pub struct QueueHacks: u32 {
        const MGS2_ACID = 1 << 0;
        const SONIC = 1 << 1;
        const RENDERPASS_MERGE = 1 << 2;
    }
}

/// Optimizes renderpasses, then sequences them.
pub fn preprocess_steps(steps: &mut Vec<Step>, hacks: QueueHacks) {
    fill_final_layouts(steps);
    hoist_clears(steps);

    if hacks.contains(QueueHacks::MGS2_ACID) {
        // Massive speedup.
        apply_mgs_hack(steps);
    }
    if hacks.contains(QueueHacks::SONIC) {
        apply_sonic_hack(steps);
    }
    if hacks.contains(QueueHacks::RENDERPASS_MERGE) {
        apply_render_pass_merge(steps);
    }
}

/// Any render step that never got a final layout assigned stays in
/// the attachment-optimal layout when its pass ends.
fn fill_final_layouts(steps: &mut Vec<Step>) {
    for step in steps.iter_mut() {
        if let StepKind::Render(r) = &mut step.kind {
            if r.framebuffer.is_some() {
                if r.final_color_layout == vk::ImageLayout::UNDEFINED {
                    r.final_color_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                }
                if r.final_depth_layout == vk::ImageLayout::UNDEFINED {
                    r.final_depth_layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
                }
            }
        }
    }
}

fn render_fb_id(step: &Step) -> Option<ResourceId> {
    match &step.kind {
        StepKind::Render(r) => r.framebuffer.as_ref().map(|fb| fb.fb_id),
        _ => None,
    }
}

/// Push down empty "clear everything" renderpasses and merge them
/// into the next pass touching the same framebuffer.
fn hoist_clears(steps: &mut Vec<Step>) {
    if steps.len() < 2 {
        return;
    }

    for j in 0..steps.len() - 1 {
        let (fb_id, clear_color, clear_depth, clear_stencil, area, rp_type) =
            match &steps[j].kind {
                StepKind::Render(r) => {
                    let all_clear = r.color_load == LoadAction::Clear
                        && r.depth_load == LoadAction::Clear
                        && r.stencil_load == LoadAction::Clear;
                    if !all_clear || r.num_draws != 0 || r.num_reads != 0 {
                        continue;
                    }
                    let fb = match &r.framebuffer {
                        Some(fb) => fb.fb_id,
                        None => continue,
                    };
                    (
                        fb,
                        r.clear_color,
                        r.clear_depth,
                        r.clear_stencil,
                        r.render_area,
                        r.render_pass_type,
                    )
                }
                _ => continue,
            };

        let mut hoisted = false;
        for i in j + 1..steps.len() {
            match &mut steps[i].kind {
                StepKind::Render(r) if r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb_id) => {
                    if r.color_load != LoadAction::Clear {
                        r.color_load = LoadAction::Clear;
                        r.clear_color = clear_color;
                    }
                    if r.depth_load != LoadAction::Clear {
                        r.depth_load = LoadAction::Clear;
                        r.clear_depth = clear_depth;
                    }
                    if r.stencil_load != LoadAction::Clear {
                        r.stencil_load = LoadAction::Clear;
                        r.clear_stencil = clear_stencil;
                    }
                    merge_render_area_rect(&mut r.render_area, &area);
                    r.render_pass_type = merge_rp_types(r.render_pass_type, rp_type);
                    hoisted = true;
                    break;
                }
                StepKind::Copy(c) if c.src.fb_id == fb_id || c.dst.fb_id == fb_id => {
                    // A copy touching this framebuffer pins the clear
                    // where it is.
                    break;
                }
                StepKind::Blit(b) if b.src.fb_id == fb_id || b.dst.fb_id == fb_id => {
                    break;
                }
                _ => {}
            }
        }
        if hoisted {
            // Cheaply skip the clear-only step.
            steps[j].kind = StepKind::RenderSkip;
            steps[j].dependencies.clear();
        }
    }
}

/// Append the draw commands of `src` onto `dst`.
fn append_draws(dst: &mut Vec<RenderCommand>, src: Vec<RenderCommand>) {
    for c in src {
        if c.is_draw() {
            dst.push(c);
        }
    }
}

/// Turn a sequence of copy,render(1),copy,render(1),copy,render(1)
/// into copy,copy,copy,render(n). The game alternates tiny depal
/// draws with copies to the same target; sorting the copies first
/// lets the renders collapse into one pass.
fn apply_mgs_hack(steps: &mut Vec<Step>) {
    if steps.len() >= 4 {
        'outer: for i in 0..steps.len() - 3 {
            let promising = matches!(&steps[i].kind, StepKind::Copy(_))
                && matches!(&steps[i + 1].kind, StepKind::Render(r) if r.num_draws == 1)
                && matches!(&steps[i + 2].kind, StepKind::Copy(_))
                && {
                    let dst0 = match &steps[i].kind {
                        StepKind::Copy(c) => c.dst.fb_id,
                        _ => unreachable!(),
                    };
                    matches!(&steps[i + 2].kind, StepKind::Copy(c) if c.dst.fb_id == dst0)
                };
            if !promising {
                continue;
            }
            let copy_dst = match &steps[i].kind {
                StepKind::Copy(c) => c.dst.fb_id,
                _ => unreachable!(),
            };

            // Find where the pattern stops; running off the end of
            // the list also ends it.
            let mut last: Option<usize> = None;
            for j in i..steps.len() {
                match &steps[j].kind {
                    StepKind::Render(r) => {
                        if r.num_draws > 1 {
                            last = Some(j - 1);
                        }
                        // Should really also check descriptor sets...
                        if let Some(RenderCommand::DrawIndexed { count, .. }) = r.commands.last() {
                            if *count != 6 {
                                last = Some(j - 1);
                            }
                        }
                    }
                    StepKind::Copy(c) => {
                        if c.dst.fb_id != copy_dst {
                            last = Some(j - 1);
                        }
                    }
                    _ => {
                        last = Some(j - 1);
                    }
                }
                if last.is_some() {
                    break;
                }
            }
            if last.is_none() {
                last = Some(steps.len() - 1);
            }

            if let Some(last) = last {
                if last <= i {
                    continue;
                }
                // Sort the range: all copies first, in their original
                // relative order, then the renders.
                let range: Vec<Step> = steps.splice(i..=last, std::iter::empty()).collect();
                let mut copies = Vec::new();
                let mut renders = Vec::new();
                for s in range {
                    match s.kind {
                        StepKind::Copy(_) => copies.push(s),
                        _ => renders.push(s),
                    }
                }

                // Combine the renders into the first one.
                let mut merged_commands = Vec::new();
                for r in renders.iter_mut().skip(1) {
                    if let StepKind::Render(render) = &mut r.kind {
                        merged_commands.append(&mut render.commands);
                    }
                    r.kind = StepKind::RenderSkip;
                    r.dependencies.clear();
                }
                if let Some(first) = renders.first_mut() {
                    if let StepKind::Render(render) = &mut first.kind {
                        render.commands.extend(merged_commands);
                    }
                }

                log::debug!(
                    "mgs hack: reordered {} copies ahead of {} renders",
                    copies.len(),
                    renders.len()
                );

                let insert_at = i;
                copies.extend(renders);
                steps.splice(insert_at..insert_at, copies);
                break 'outer;
            }
        }
    }

    // There's also a post processing effect using depals that's just
    // brutal in some parts of the game: 1-draw passes alternating
    // between a depal buffer and the target.
    if steps.len() < 4 {
        return;
    }
    for i in 0..steps.len() - 3 {
        let pattern = |idx: usize, load: LoadAction| -> Option<ResourceId> {
            match &steps[idx].kind {
                StepKind::Render(r)
                    if r.num_draws == 1 && r.color_load == load && r.framebuffer.is_some() =>
                {
                    Some(r.framebuffer.as_ref().unwrap().fb_id)
                }
                _ => None,
            }
        };

        let depal_fb = match pattern(i, LoadAction::DontCare) {
            Some(fb) => fb,
            None => continue,
        };
        let target_fb = match pattern(i + 1, LoadAction::Keep) {
            Some(fb) => fb,
            None => continue,
        };
        if pattern(i + 2, LoadAction::DontCare) != Some(depal_fb) {
            continue;
        }

        // Scan until the alternation breaks.
        let mut last: Option<usize> = None;
        for j in i..steps.len() - 3 {
            let expect = if (j - i) % 2 == 0 {
                (depal_fb, LoadAction::DontCare)
            } else {
                (target_fb, LoadAction::Keep)
            };
            if pattern(j, expect.1) != Some(expect.0) {
                break;
            }
            last = Some(j);
        }

        let last = match last {
            Some(l) => l,
            None => continue,
        };

        // Combine the depal renders into step i, the target renders
        // into step i+1.
        for (base, start) in [(i, i + 2), (i + 1, i + 3)] {
            let mut j = start;
            while j <= last {
                let cmds = match &mut steps[j].kind {
                    StepKind::Render(r) => std::mem::take(&mut r.commands),
                    _ => break,
                };
                steps[j].kind = StepKind::RenderSkip;
                steps[j].dependencies.clear();
                if let Some(r) = steps[base].render_mut() {
                    append_draws(&mut r.commands, cmds);
                }
                j += 2;
            }
        }

        // We only expect one of these sequences per frame.
        break;
    }
}

/// Turn render(3),render(1),render(6),render(1),... on two
/// alternating framebuffers into one pass per framebuffer.
fn apply_sonic_hack(steps: &mut Vec<Step>) {
    if steps.len() < 5 {
        return;
    }

    for i in 0..steps.len() - 4 {
        let draws_and_fb = |idx: usize| -> Option<(u32, ResourceId)> {
            match &steps[idx].kind {
                StepKind::Render(r) if r.framebuffer.is_some() => {
                    Some((r.num_draws, r.framebuffer.as_ref().unwrap().fb_id))
                }
                _ => None,
            }
        };

        let start = [
            draws_and_fb(i),
            draws_and_fb(i + 1),
            draws_and_fb(i + 2),
            draws_and_fb(i + 3),
        ];
        let promising = match start {
            [Some((3, fb0)), Some((1, fb1)), Some((6, fb2)), Some((1, fb3))] => {
                fb0 == fb2 && fb1 == fb3 && fb0 != fb1
            }
            _ => false,
        };
        if !promising {
            continue;
        }
        let fb_a = start[0].unwrap().1;
        let fb_b = start[1].unwrap().1;

        // Find the last step of the alternation; running off the end
        // of the list also ends it.
        let mut last: Option<usize> = None;
        for j in i..steps.len() {
            match draws_and_fb(j) {
                Some((draws, fb)) => {
                    if (j - i) % 2 == 1 {
                        if fb != fb_b || draws != 1 {
                            last = Some(j - 1);
                        }
                    } else {
                        if fb != fb_a || (draws != 3 && draws != 6) {
                            last = Some(j - 1);
                        }
                    }
                }
                None => {
                    last = Some(j - 1);
                }
            }
            if last.is_some() {
                break;
            }
        }
        if last.is_none() {
            last = Some(steps.len() - 1);
        }

        if let Some(last) = last {
            if last <= i {
                continue;
            }

            // Partition by target framebuffer, keeping order within
            // each partition, then merge each partition into its
            // first step.
            let range: Vec<Step> = steps.splice(i..=last, std::iter::empty()).collect();
            let mut type1 = Vec::new();
            let mut type2 = Vec::new();
            for s in range {
                if render_fb_id(&s) == Some(fb_a) {
                    type1.push(s);
                } else {
                    type2.push(s);
                }
            }

            for group in [&mut type1, &mut type2] {
                let mut merged = Vec::new();
                for s in group.iter_mut().skip(1) {
                    if let StepKind::Render(r) = &mut s.kind {
                        merged.append(&mut r.commands);
                    }
                    s.kind = StepKind::RenderSkip;
                    s.dependencies.clear();
                }
                if let Some(first) = group.first_mut() {
                    if let StepKind::Render(r) = &mut first.kind {
                        r.commands.extend(merged);
                    }
                }
            }

            log::debug!(
                "sonic hack: merged {}+{} renders across two targets",
                type1.len(),
                type2.len()
            );

            let insert_at = i;
            type1.extend(type2);
            steps.splice(insert_at..insert_at, type1);
            break;
        }
    }
}

fn merge_render_steps(dst: &mut RenderStep, mut src: RenderStep) {
    // Slurp up the commands and any pretransitions.
    for t in src.pre_transitions.drain(..) {
        dst.add_pre_transition(t);
    }
    dst.commands.append(&mut src.commands);
    merge_render_area_rect(&mut dst.render_area, &src.render_area);
    dst.num_draws += src.num_draws;
    dst.num_reads += src.num_reads;
    dst.pipeline_flags |= src.pipeline_flags;
    dst.render_pass_type = merge_rp_types(dst.render_pass_type, src.render_pass_type);
}

/// Merge repeated renderpasses to the same framebuffer across
/// intermediate steps, when no intermediate step reads the target and
/// nothing the absorbed passes wrote is depended on in between.
///
/// Dependency calculation really must be perfect here.
fn apply_render_pass_merge(steps: &mut Vec<Step>) {
    // First count how many times each framebuffer is rendered to.
    let mut counts: HashMap<ResourceId, u32> = HashMap::new();
    for step in steps.iter() {
        if let Some(fb) = render_fb_id(step) {
            *counts.entry(fb).or_insert(0) += 1;
        }
    }

    for i in 0..steps.len() {
        let fb = match render_fb_id(&steps[i]) {
            Some(fb) if counts[&fb] > 1 => fb,
            _ => continue,
        };

        // Framebuffers written between here and a merge candidate;
        // we can't merge past a pass that depends on one of these.
        let mut touched: Vec<ResourceId> = Vec::new();

        'scan: for j in i + 1..steps.len() {
            // If any other pass reads this framebuffer as-is, cancel
            // the scan. Reading from itself means a KEEP, which is
            // fine.
            if steps[j].depends_on(fb) {
                let self_read = matches!(
                    &steps[j].kind,
                    StepKind::Render(r) if r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb)
                );
                if !self_read {
                    break 'scan;
                }
            }

            enum Action {
                Absorb,
                Stop,
                Touch(ResourceId),
                Nothing,
            }

            let action = match &steps[j].kind {
                StepKind::Render(r) => {
                    if r.framebuffer.as_ref().map(|f| f.fb_id) == Some(fb) {
                        // A clear in the candidate, or a dependency on
                        // anything written in between, blocks the merge.
                        if r.has_clear_load() || steps[j].depends_on_any(&touched) {
                            Action::Stop
                        } else {
                            Action::Absorb
                        }
                    } else if let Some(other) = r.framebuffer.as_ref().map(|f| f.fb_id) {
                        // Remember what this wrote; later passes that
                        // depend on it can't be merged across.
                        Action::Touch(other)
                    } else {
                        Action::Nothing
                    }
                }
                // Without framebuffer renaming we can't merge past a
                // clobbered fb.
                StepKind::Copy(c) => {
                    if c.dst.fb_id == fb {
                        Action::Stop
                    } else {
                        Action::Touch(c.dst.fb_id)
                    }
                }
                StepKind::Blit(b) => {
                    if b.dst.fb_id == fb {
                        Action::Stop
                    } else {
                        Action::Touch(b.dst.fb_id)
                    }
                }
                // When executed, a readback is always the last step
                // since we stall and wait right after.
                StepKind::Readback(_) => Action::Nothing,
                StepKind::ReadbackImage(_) => Action::Nothing,
                StepKind::RenderSkip => Action::Nothing,
            };

            match action {
                Action::Stop => break 'scan,
                Action::Absorb => {
                    let kind = std::mem::replace(&mut steps[j].kind, StepKind::RenderSkip);
                    steps[j].dependencies.clear();
                    if let StepKind::Render(src) = kind {
                        if let StepKind::Render(dst) = &mut steps[i].kind {
                            merge_render_steps(dst, src);
                        }
                    }
                }
                Action::Touch(id) => {
                    if !touched.contains(&id) {
                        touched.push(id);
                    }
                }
                Action::Nothing => {}
            }
        }
    }
}
