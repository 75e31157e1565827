use std::ops::Range;

use crate::format::Placement;
use crate::pixel::Pixel;
use crate::plane::Plane;
use crate::{EnlargeError, EnlargeResult};

const ROWS_PER_CHECK: usize = 50;

/// Area-weighted accumulation of `src[range]` into `dst` at scale `scale < 1`.
///
/// `dst` is indexed in full destination coordinates; the first touched entry
/// is `int(range.start * scale)`. Entries past the end of `dst` are dropped,
/// so callers size the buffer with a little slack.
pub(crate) fn accumulate_line<T: Pixel>(src: &[T], range: Range<usize>, scale: f32, dst: &mut [T]) {
    dst.fill(T::zero());
    let start_floor = range.start as f32 * scale;
    let mut dst_x = start_floor as usize;
    let mut floor = start_floor - dst_x as f32;
    let end = range.end.min(src.len());
    for &value in &src[range.start.min(end)..end] {
        let ff = floor + scale - 1.0;
        if ff > 0.0 {
            if let Some(slot) = dst.get_mut(dst_x) {
                slot.add_mul(value, scale - ff);
            }
            dst_x += 1;
            floor -= 1.0;
            if let Some(slot) = dst.get_mut(dst_x) {
                *slot = value * ff;
            }
        } else if let Some(slot) = dst.get_mut(dst_x) {
            slot.add_mul(value, scale);
        }
        floor += scale;
    }
}

// First source index that can reach clip start `c0`, and the starting floor.
fn source_start(c0: usize, inv_scale: f32, scale: f32) -> (usize, usize, f32) {
    if c0 == 0 {
        return (0, 0, 0.0);
    }
    let src0 = ((c0 - 1) as f32 * inv_scale + 0.5) as usize;
    let floor = src0 as f32 * scale;
    let dst0 = floor as usize;
    (src0, dst0, floor - dst0 as f32)
}

/// Exact area-weighted decimation of `src` into the clipped output `dst`.
///
/// Both scales must be at most one. Rows are processed top to
/// bottom; `cancel` is polled every 50 source rows and `progress` receives
/// the completed fraction.
pub fn shrink_clip<T: Pixel>(
    src: &Plane<T>,
    placement: &Placement,
    dst: &mut Plane<T>,
    cancel: Option<&(dyn Fn() -> bool + Send + Sync)>,
    progress: &mut dyn FnMut(f32),
) -> EnlargeResult<()> {
    let p = placement;
    let (scale_x, scale_y) = (p.scale_x, p.scale_y);

    let (src_x0, _, _) = source_start(p.clip_x0, p.inv_scale_x, scale_x);
    let src_x1 = (((p.clip_x1 + 1) as f32 * p.inv_scale_x + 0.5) as usize).min(p.src_width);
    let (src_y0, mut dst_y, mut floor_y) = source_start(p.clip_y0, p.inv_scale_y, scale_y);
    let src_y1 = (((p.clip_y1 + 1) as f32 * p.inv_scale_y + 0.5) as usize + 1).min(p.src_height);

    let mut add_line = vec![T::zero(); p.dst_width + 2];
    let mut dst_line = vec![T::zero(); p.dst_width + 2];
    let rows = src_y1.saturating_sub(src_y0).max(1) as f32;

    for (n, src_y) in (src_y0..src_y1).enumerate() {
        if n % ROWS_PER_CHECK == 0 {
            if cancel.map_or(false, |check| check()) {
                return Err(EnlargeError::Cancelled);
            }
            progress(n as f32 / rows);
        }
        accumulate_line(src.row(src_y), src_x0..src_x1, scale_x, &mut add_line);
        let ff = floor_y + scale_y - 1.0;
        if ff > 0.0 {
            for x in p.clip_x0..p.clip_x1 {
                dst_line[x].add_mul(add_line[x], scale_y - ff);
            }
            write_line(p, dst_y, &dst_line, dst);
            floor_y -= 1.0;
            dst_y += 1;
            for x in p.clip_x0..p.clip_x1 {
                dst_line[x] = add_line[x] * ff;
            }
        } else {
            for x in p.clip_x0..p.clip_x1 {
                dst_line[x].add_mul(add_line[x], scale_y);
            }
        }
        floor_y += scale_y;
    }
    write_line(p, dst_y, &dst_line, dst);
    progress(1.0);
    Ok(())
}

fn write_line<T: Pixel>(p: &Placement, dst_y: usize, line: &[T], dst: &mut Plane<T>) {
    if dst_y < p.clip_y0 || dst_y >= p.clip_y1 {
        return;
    }
    let y = dst_y - p.clip_y0 + p.offset_y;
    if y >= dst.height {
        return;
    }
    for x in p.clip_x0..p.clip_x1 {
        let ox = x - p.clip_x0 + p.offset_x;
        if ox < dst.width {
            dst.set(ox, y, line[x]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn gradient(width: usize, height: usize) -> Plane<f32> {
        let data = (0..width * height)
            .map(|i| {
                let (x, y) = ((i % width) as f32, (i / width) as f32);
                0.2 + 0.6 * ((x * 0.37).sin() * (y * 0.21).cos()).abs()
            })
            .collect();
        Plane::from_vec(width, height, data)
    }

    fn run(src: &Plane<f32>, format: &Format) -> Plane<f32> {
        let placement = Placement::new(format);
        let mut dst = Plane::new(placement.out_width, placement.out_height);
        shrink_clip(src, &placement, &mut dst, None, &mut |_| {}).unwrap();
        dst
    }

    #[test]
    fn accumulate_line_preserves_line_energy() {
        let src: Vec<f32> = (0..17).map(|i| (i as f32 * 0.3).cos().abs()).collect();
        let scale = 7.0 / 17.0;
        let mut dst = vec![0.0f32; 9];
        accumulate_line(&src, 0..src.len(), scale, &mut dst);
        let lhs: f32 = dst.iter().sum::<f32>() / scale;
        let rhs: f32 = src.iter().sum();
        assert!((lhs - rhs).abs() < 1e-3, "{lhs} vs {rhs}");
    }

    #[test]
    fn full_shrink_conserves_energy() {
        let src = gradient(97, 61);
        for &(sx, sy) in &[(0.5f32, 0.5f32), (0.33, 0.71), (0.9, 0.25)] {
            let format = Format::new(97, 61, sx, sy);
            let dst = run(&src, &format);
            let p = Placement::new(&format);
            let lhs = dst.sum() / (p.scale_x as f64 * p.scale_y as f64);
            let rhs = src.sum();
            assert!((lhs - rhs).abs() / rhs < 2e-3, "{sx}x{sy}: {lhs} vs {rhs}");
        }
    }

    #[test]
    fn clipped_shrink_matches_full_shrink_subregion() {
        let src = gradient(80, 80);
        let full_format = Format::uniform(80, 80, 0.5);
        let full = run(&src, &full_format);
        let clipped = run(&src, &full_format.with_dst_clip(10, 12, 30, 40));
        assert_eq!((clipped.width, clipped.height), (20, 28));
        for y in 0..28 {
            for x in 0..20 {
                let a = clipped.get(x, y);
                let b = full.get(x + 10, y + 12);
                assert!((a - b).abs() < 1e-5, "({x},{y}): {a} vs {b}");
            }
        }
    }

    #[test]
    fn cancel_stops_before_writing() {
        let src = gradient(40, 40);
        let placement = Placement::new(&Format::uniform(40, 40, 0.5));
        let mut dst = Plane::new(placement.out_width, placement.out_height);
        let cancel = || true;
        let result = shrink_clip(&src, &placement, &mut dst, Some(&cancel), &mut |_| {});
        assert!(matches!(result, Err(EnlargeError::Cancelled)));
        assert!(dst.pixels().iter().all(|&v| v == 0.0));
    }
}
