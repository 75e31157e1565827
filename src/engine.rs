use rand::Rng;
use tracing::{debug, trace};

use crate::format::{Format, Placement};
use crate::kernels::{DiffTables, InverseTable, KernelSet, Taps};
use crate::model::{Coefficients, derive_coefficients};
use crate::noise::FractalNoiseTable;
use crate::params::EnlargeParams;
use crate::pixel::Pixel;
use crate::plane::{FilterScratch, Plane};
use crate::rng;
use crate::shrink::shrink_clip;
use crate::{EnlargeError, EnlargeResult};

pub const TILE: usize = 512;
/// Extra source pixels read around every tile.
pub const SRC_MARGIN: usize = 9;
/// Destination rows computed between two cancellation checks.
pub const ROWS_PER_SLICE: usize = 50;

pub type CancelFn<'a> = Option<&'a (dyn Fn() -> bool + Send + Sync)>;

#[inline]
fn check(cancel: CancelFn<'_>) -> EnlargeResult<()> {
    if cancel.map_or(false, |check| check()) {
        return Err(EnlargeError::Cancelled);
    }
    Ok(())
}

#[inline]
fn smoothstep(x: f32) -> f32 {
    x * x * (3.0 - 2.0 * x)
}

// Neighbour edge weight: positive only where `v` exceeds both opposite neighbours.
#[inline]
fn ridge(f: f32, f2: f32) -> f32 {
    let m = f.min(f2);
    if m < 0.0 { 0.0 } else { 6.0 * m * m }
}

#[derive(Debug)]
struct TileBuffers<T> {
    src: Plane<T>,
    dst: Plane<T>,
    dx: Plane<T>,
    dy: Plane<T>,
    d2x: Plane<T>,
    d2y: Plane<T>,
    dxy: Plane<T>,
    curvature: Plane<T>,
    base_weights: Plane<f32>,
    work_mask: Plane<f32>,
    intensity: Plane<f32>,
    mask_dst: Plane<f32>,
    row_pass: Plane<T>,
    mask_row_pass: Plane<f32>,
    spare: Plane<f32>,
    filters: FilterScratch<T>,
}

impl<T: Pixel> TileBuffers<T> {
    fn new(src_w: usize, src_h: usize) -> EnlargeResult<Self> {
        Ok(Self {
            src: Plane::try_new(src_w, src_h)?,
            dst: Plane::try_new(TILE, TILE)?,
            dx: Plane::try_new(src_w, src_h)?,
            dy: Plane::try_new(src_w, src_h)?,
            d2x: Plane::try_new(src_w, src_h)?,
            d2y: Plane::try_new(src_w, src_h)?,
            dxy: Plane::try_new(src_w, src_h)?,
            curvature: Plane::try_new(src_w, src_h)?,
            base_weights: Plane::try_new(src_w, src_h)?,
            work_mask: Plane::try_new(src_w, src_h)?,
            intensity: Plane::try_new(src_w, src_h)?,
            mask_dst: Plane::try_new(TILE, TILE)?,
            row_pass: Plane::try_new(TILE, src_h)?,
            mask_row_pass: Plane::try_new(TILE, src_h)?,
            spare: Plane::try_new(src_w, src_h)?,
            filters: FilterScratch::try_new(src_w, src_h)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Tile {
    dst_x: usize,
    dst_y: usize,
    src_x: isize,
    src_y: isize,
    min_x: usize,
    max_x: usize,
    min_y: usize,
    max_y: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Neighbour<T> {
    color: T,
    weight: f32,
    dx: T,
    dy: T,
    d2x: T,
    d2y: T,
    dxy: T,
    intensity: f32,
    center_w: f32,
    fract_x: i64,
    fract_y: i64,
    fract_val: f32,
}

/// Adaptive tiled resampler for one [`Format`] and parameter set.
///
/// All buffers are allocated by [`Enlarger::new`]; [`Enlarger::run`] never
/// allocates anything proportional to the image size.
pub struct Enlarger<T> {
    placement: Placement,
    coeffs: Coefficients,
    seed: u64,
    kernels: Option<KernelSet>,
    diff: DiffTables,
    inverse: InverseTable,
    buffers: Option<TileBuffers<T>>,
}

impl<T: Pixel> Enlarger<T> {
    pub fn new(format: &Format, params: &EnlargeParams) -> EnlargeResult<Self> {
        format.validate()?;
        params.validate()?;
        let placement = Placement::new(format);
        let coeffs = derive_coefficients(params);
        let diff = DiffTables::new(&coeffs);

        let shrinking = placement.scale_x < 1.0 && placement.scale_y < 1.0;
        let (kernels, buffers) = if shrinking {
            (None, None)
        } else {
            let src_w = (placement.inv_scale_x * TILE as f32 + 0.5) as usize + 2 * SRC_MARGIN;
            let src_h = (placement.inv_scale_y * TILE as f32 + 0.5) as usize + 2 * SRC_MARGIN;
            let buffers = TileBuffers::new(src_w, src_h)?;
            let kernels = KernelSet::new(
                placement.scale_x,
                placement.scale_y,
                placement.dst_width,
                placement.dst_height,
            );
            (Some(kernels), Some(buffers))
        };

        Ok(Self {
            placement,
            coeffs,
            seed: rng::DEFAULT_SEED,
            kernels,
            diff,
            inverse: InverseTable::new(),
            buffers,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn coefficients(&self) -> &Coefficients {
        &self.coeffs
    }

    pub fn only_shrinking(&self) -> bool {
        self.buffers.is_none()
    }

    pub fn allocate_output(&self) -> EnlargeResult<Plane<T>> {
        Plane::try_new(self.placement.out_width, self.placement.out_height)
    }

    /// Resamples `src` into `dst`, which must be `out_width x out_height`.
    ///
    /// `noise` is only consulted when the fractal-noise slider is non-zero.
    /// `progress` receives the completed fraction in `[0, 1]`.
    pub fn run(
        &mut self,
        src: &Plane<T>,
        dst: &mut Plane<T>,
        noise: Option<&FractalNoiseTable>,
        cancel: CancelFn<'_>,
        progress: &mut dyn FnMut(f32),
    ) -> EnlargeResult<()> {
        let p = self.placement;
        if src.width != p.src_width || src.height != p.src_height {
            return Err(EnlargeError::Message(format!(
                "source is {}x{}, format expects {}x{}",
                src.width, src.height, p.src_width, p.src_height
            )));
        }
        if dst.width != p.out_width || dst.height != p.out_height {
            return Err(EnlargeError::Message(format!(
                "destination is {}x{}, clip needs {}x{}",
                dst.width, dst.height, p.out_width, p.out_height
            )));
        }
        dst.fill(T::zero());
        progress(0.0);

        let Some(mut buffers) = self.buffers.take() else {
            return shrink_clip(src, &p, dst, cancel, progress);
        };
        let result = self.run_tiles(&mut buffers, src, dst, noise, cancel, progress);
        self.buffers = Some(buffers);
        result
    }

    fn run_tiles(
        &self,
        buf: &mut TileBuffers<T>,
        src: &Plane<T>,
        dst: &mut Plane<T>,
        noise: Option<&FractalNoiseTable>,
        cancel: CancelFn<'_>,
        progress: &mut dyn FnMut(f32),
    ) -> EnlargeResult<()> {
        let p = &self.placement;
        let noise = noise.filter(|_| self.coeffs.fract > 0.0);
        let tiles_x = p.inner_width() / TILE + 1;
        let tiles_y = p.inner_height() / TILE + 1;
        let step = 1.0 / (tiles_x * tiles_y * TILE) as f32;
        let mut done = 0.0f32;

        for dst_y in (p.clip_y0..p.clip_y1).step_by(TILE) {
            for dst_x in (p.clip_x0..p.clip_x1).step_by(TILE) {
                check(cancel)?;
                let tile = self.begin_tile(dst_x, dst_y);
                trace!(dst_x, dst_y, "tile");

                buf.src.copy_from(src, tile.src_x, tile.src_y);
                buf.src.reduce_noise(self.coeffs.denoise, &mut buf.filters);
                buf.src.sharpen(self.coeffs.pre_sharpen, &mut buf.filters);
                self.base_weights(buf);
                check(cancel)?;

                self.smooth_pass(buf, &tile);

                let mut start = tile.min_y;
                let mut reported = 0usize;
                while start + ROWS_PER_SLICE < tile.max_y {
                    check(cancel)?;
                    self.adaptive_rows(buf, &tile, noise, start, start + ROWS_PER_SLICE);
                    done += step * (start + ROWS_PER_SLICE - reported) as f32;
                    reported = start + ROWS_PER_SLICE;
                    progress(done.min(1.0));
                    start += ROWS_PER_SLICE;
                }
                check(cancel)?;
                self.adaptive_rows(buf, &tile, noise, start, tile.max_y);

                self.dither(buf, &tile);
                if let Some(noise) = noise {
                    self.fract_modulate(buf, &tile, noise);
                }
                buf.dst.clamp01();
                self.write_tile(buf, &tile, dst);

                done += step * TILE.saturating_sub(reported) as f32;
                progress(done.min(1.0));
            }
        }
        debug!(
            width = p.out_width,
            height = p.out_height,
            "tiled enlarge finished"
        );
        progress(1.0);
        Ok(())
    }

    fn begin_tile(&self, dst_x: usize, dst_y: usize) -> Tile {
        let p = &self.placement;
        Tile {
            dst_x,
            dst_y,
            src_x: p.src_x(dst_x) - SRC_MARGIN as isize,
            src_y: p.src_y(dst_y) - SRC_MARGIN as isize,
            min_x: p.clip_x0.saturating_sub(dst_x),
            max_x: (p.clip_x1 - dst_x).min(TILE),
            min_y: p.clip_y0.saturating_sub(dst_y),
            max_y: (p.clip_y1 - dst_y).min(TILE),
        }
    }

    #[inline]
    fn block_x(&self, tile: &Tile, dbx: usize) -> usize {
        (self.placement.src_x(dbx + tile.dst_x) - tile.src_x) as usize
    }

    #[inline]
    fn block_y(&self, tile: &Tile, dby: usize) -> usize {
        (self.placement.src_y(dby + tile.dst_y) - tile.src_y) as usize
    }

    /// Derivatives, detail intensity, base weights and the work mask.
    fn base_weights(&self, buf: &mut TileBuffers<T>) {
        self.read_derivatives(buf);
        let c = &self.coeffs;
        let (w, h) = (buf.src.width, buf.src.height);

        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let intensity = buf.intensity.get(x, y);
                let grad = buf.dx.get(x, y).norm1() + buf.dy.get(x, y).norm1();
                let weight = (1.0 - 12.0 * grad * intensity).clamp(0.0, 1.0) + 0.0001;
                let work = 20.0 * grad * (intensity + 0.9);
                let work = (work * work - 0.7).clamp(0.0, 1.0);
                buf.base_weights.set(x, y, weight);
                buf.work_mask.set(x, y, work);
            }
        }

        buf.spare.data.copy_from_slice(&buf.base_weights.data);
        let bw = &buf.spare;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let intensity = buf.intensity.get(x, y);
                let grad = buf.dx.get(x, y).norm1() + buf.dy.get(x, y).norm1();
                let lap = buf.curvature.get(x, y).norm1();
                let v = bw.get(x, y);

                let mut dd = ridge(v - bw.get(x - 1, y - 1), v - bw.get(x + 1, y + 1));
                dd += ridge(v - bw.get(x - 1, y + 1), v - bw.get(x + 1, y - 1));
                dd *= 0.5;
                dd += ridge(v - bw.get(x, y + 1), v - bw.get(x, y - 1));
                dd += ridge(v - bw.get(x - 1, y), v - bw.get(x + 1, y));
                dd *= 1.0 / 3.0;

                dd = v - c.line_neg_f * dd;
                if dd < 0.01 {
                    dd = 0.01 / (2.0 - dd * 100.0);
                }
                dd = dd.powf(c.sharp_exp);

                let cc = (1.0 - 12.0 * grad * intensity).clamp(0.0, 1.0);
                let cc = (10.0 * lap * intensity * (0.4 + cc)).min(1.0);
                dd += c.line_pos_f * cc * cc;
                buf.base_weights.set(x, y, dd.max(0.0));
            }
        }
        buf.spare.data.copy_from_slice(&buf.work_mask.data);
        buf.work_mask.smoothen_from(&buf.spare);
    }

    fn read_derivatives(&self, buf: &mut TileBuffers<T>) {
        let src = &buf.src;
        let (w, h) = (src.width, src.height);
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                buf.dx.set(x, y, src.dx(x, y));
                buf.dy.set(x, y, src.dy(x, y));
                buf.d2x.set(x, y, src.d2x(x, y));
                buf.d2y.set(x, y, src.d2y(x, y));
                buf.dxy.set(x, y, src.dxy(x, y));
                buf.curvature.set(x, y, src.laplace(x, y));
            }
        }

        // Inverse local variation over a 7x7 window.
        buf.intensity.fill(0.0);
        for y in 3..h.saturating_sub(3) {
            for x in 3..w.saturating_sub(3) {
                let c = src.get(x, y);
                let mut sum = 0.0f32;
                for sy in y - 3..=y + 3 {
                    for sx in x - 3..=x + 3 {
                        sum += (src.get(sx, sy) - c).norm1();
                    }
                }
                buf.intensity
                    .set(x, y, self.inverse.inverse(sum * 0.5 + 0.05));
            }
        }

        buf.spare.data.copy_from_slice(&buf.intensity.data);
        let raw = &buf.spare;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let mut lowest = 1000.0f32;
                for sy in y - 1..=y + 1 {
                    for sx in x - 1..=x + 1 {
                        lowest = lowest.min(raw.get(sx, sy));
                    }
                }
                buf.intensity.set(x, y, lowest);
            }
        }
        buf.intensity.smooth_into(&mut buf.spare);
        buf.spare.smooth_into(&mut buf.intensity);
    }

    /// Separable 5-tap baseline for the colour tile and the work mask.
    fn smooth_pass(&self, buf: &mut TileBuffers<T>, tile: &Tile) {
        let Some(kernels) = &self.kernels else {
            return;
        };
        let first = self.block_y(tile, tile.min_y) - 2;
        let last = self.block_y(tile, tile.max_y.saturating_sub(1).max(tile.min_y)) + 2;

        for sy in first..=last {
            for dbx in tile.min_x..tile.max_x {
                let sx = self.block_x(tile, dbx);
                let k = kernels.enlarge_x.get(dbx + tile.dst_x);
                let mut color = T::zero();
                let mut mask = 0.0f32;
                for (a, &tap) in k.iter().enumerate() {
                    color.add_mul(buf.src.get(sx + a - 2, sy), tap);
                    mask += buf.work_mask.get(sx + a - 2, sy) * tap;
                }
                buf.row_pass.set(dbx, sy, color);
                buf.mask_row_pass.set(dbx, sy, mask);
            }
        }

        for dby in tile.min_y..tile.max_y {
            let sy = self.block_y(tile, dby);
            let k = kernels.enlarge_y.get(dby + tile.dst_y);
            for dbx in tile.min_x..tile.max_x {
                let mut color = T::zero();
                let mut mask = 0.0f32;
                for (a, &tap) in k.iter().enumerate() {
                    color.add_mul(buf.row_pass.get(dbx, sy + a - 2), tap);
                    mask += buf.mask_row_pass.get(dbx, sy + a - 2) * tap;
                }
                buf.dst.set(dbx, dby, color);
                buf.mask_dst.set(dbx, dby, mask);
            }
        }
    }

    fn read_neighbours(
        &self,
        buf: &TileBuffers<T>,
        tile: &Tile,
        sx: usize,
        sy: usize,
        noise: Option<&FractalNoiseTable>,
        out: &mut [Neighbour<T>; 25],
    ) {
        for ny in 0..5 {
            for nx in 0..5 {
                let (x, y) = (sx + nx - 2, sy + ny - 2);
                let curvature = buf.curvature.get(x, y);
                let intensity = buf.intensity.get(x, y);
                let mut center_w = (curvature.norm1() * intensity * 30.0).min(1.0);
                center_w *= center_w;
                center_w *= center_w;
                center_w *= center_w;

                let n = &mut out[ny * 5 + nx];
                n.color = buf.src.get(x, y);
                n.weight = buf.base_weights.get(x, y);
                n.dx = buf.dx.get(x, y);
                n.dy = buf.dy.get(x, y);
                n.d2x = buf.d2x.get(x, y);
                n.d2y = buf.d2y.get(x, y);
                n.dxy = buf.dxy.get(x, y);
                n.intensity = intensity;
                n.center_w = center_w;
                if let Some(noise) = noise {
                    let abs_x = x as i64 + tile.src_x as i64;
                    let abs_y = y as i64 + tile.src_y as i64;
                    let (cx, cy, val) = noise.kernel_center(abs_x, abs_y);
                    n.fract_x = cx;
                    n.fract_y = cy;
                    n.fract_val = val;
                }
            }
        }
    }

    /// Detail-aware reconstruction of tile rows `start..end`.
    fn adaptive_rows(
        &self,
        buf: &mut TileBuffers<T>,
        tile: &Tile,
        noise: Option<&FractalNoiseTable>,
        start: usize,
        end: usize,
    ) {
        let Some(kernels) = &self.kernels else {
            return;
        };
        let p = &self.placement;
        let c = &self.coeffs;
        let end = end.min(tile.max_y);
        let mut neighbours = [Neighbour::<T>::default(); 25];
        let mut mod_colors = [T::zero(); 25];
        let mut weights = [0.0f32; 25];

        for dby in start.max(tile.min_y)..end {
            let dst_y = dby + tile.dst_y;
            let ker_y: Taps = *kernels.select_y.get(dst_y);
            let sy = self.block_y(tile, dby);
            let src_ym2 = sy as isize - 2 + tile.src_y;
            let fy = dst_y as f32 * p.inv_scale_y - src_ym2 as f32 - 0.25;
            let mut loaded_x = usize::MAX;

            for dbx in tile.min_x..tile.max_x {
                let mut w_mask = buf.mask_dst.get(dbx, dby) - 0.01;
                if w_mask <= 0.0 {
                    continue;
                }
                w_mask *= 1.5;
                w_mask = if w_mask > 1.0 { 1.0 } else { smoothstep(w_mask) };

                let dst_x = dbx + tile.dst_x;
                let ker_x: Taps = *kernels.select_x.get(dst_x);
                let sx = self.block_x(tile, dbx);
                if sx != loaded_x {
                    self.read_neighbours(buf, tile, sx, sy, noise, &mut neighbours);
                    loaded_x = sx;
                }
                let src_xm2 = sx as isize - 2 + tile.src_x;
                let fx = dst_x as f32 * p.inv_scale_x - src_xm2 as f32 - 0.25;

                let mut small = buf.dst.get(dbx, dby);
                let mut small_fract = small;
                if let Some(noise) = noise {
                    let wf = noise.get(dst_x as i64, dst_y as i64);
                    small_fract = (small_fract + small_fract * (c.fract * 0.01 * wf)).clip();
                }

                let mut total = 0.0f32;
                for ny in 0..5 {
                    for nx in 0..5 {
                        let a = ny * 5 + nx;
                        let n = &neighbours[a];
                        let px = fx - nx as f32;
                        let py = fy - ny as f32;

                        let mut w = 0.0f32;
                        let mut modeled = n.color;
                        if c.deriv_f > 0.0 {
                            let quad = (n.dx * px
                                + n.dy * py
                                + n.d2x * (0.35 * px * px)
                                + n.d2y * (0.35 * py * py)
                                + n.dxy * (0.7 * px * py))
                                * c.deriv_f;
                            modeled += quad;
                            w = c.deriv_diff_f * quad.norm1();
                        }
                        w = 10.0 * (w + (modeled - small_fract).norm1()) * n.intensity;
                        w = n.weight * ker_x[nx] * ker_y[ny] * self.diff.select_weight(w);
                        w *= 1.0 + (self.diff.center_weight(px * px + py * py) - 1.0) * n.center_w;

                        if let Some(noise) = noise {
                            let fx_n = (px * p.scale_x) as i64 + n.fract_x;
                            let fy_n = (py * p.scale_y) as i64 + n.fract_y;
                            let mut ww =
                                1.0 + 1.5 * c.fract * (noise.get(fx_n, fy_n) - n.fract_val);
                            if ww < 0.01 {
                                ww = 0.02 - ww;
                            }
                            if ww > 3.0 {
                                ww = 6.0 - ww;
                            }
                            if ww < 0.01 {
                                ww = 0.02 - ww;
                            }
                            w *= ww;
                        }

                        w += 1e-9;
                        weights[a] = w;
                        mod_colors[a] = modeled;
                        total += w;
                    }
                }

                let norm = 1.0 / total;
                let mut color = T::zero();
                for (m, &w) in mod_colors.iter().zip(weights.iter()) {
                    color.add_mul(*m, w * norm);
                }
                small.add_mul(color - small, w_mask);
                buf.dst.set(dbx, dby, small);
            }
        }
    }

    fn dither(&self, buf: &mut TileBuffers<T>, tile: &Tile) {
        if self.coeffs.dither <= 0.0 {
            return;
        }
        let max_w = 0.5 * self.coeffs.dither;
        let mut rng = rng::tile_rng(self.seed, tile.dst_x as i64, tile.dst_y as i64);
        for dby in tile.min_y..tile.max_y {
            for dbx in tile.min_x..tile.max_x {
                let w = (2.0 * rng.random::<f32>() - 1.0) * rng.random::<f32>();
                let mut value = buf.dst.get(dbx, dby);
                value.perturb(w, max_w);
                buf.dst.set(dbx, dby, value);
            }
        }
    }

    fn fract_modulate(&self, buf: &mut TileBuffers<T>, tile: &Tile, noise: &FractalNoiseTable) {
        let max_w = 0.2 * self.coeffs.fract;
        for dby in tile.min_y..tile.max_y {
            for dbx in tile.min_x..tile.max_x {
                let x = (dbx + tile.dst_x) as i64;
                let y = (dby + tile.dst_y) as i64;
                let w = 0.03 * noise.get(x, y);
                let mut value = buf.dst.get(dbx, dby);
                value.perturb(w, max_w);
                buf.dst.set(dbx, dby, value);
            }
        }
    }

    fn write_tile(&self, buf: &TileBuffers<T>, tile: &Tile, dst: &mut Plane<T>) {
        let p = &self.placement;
        for dby in tile.min_y..tile.max_y {
            let y = dby + tile.dst_y - p.clip_y0 + p.offset_y;
            if y >= dst.height {
                continue;
            }
            for dbx in tile.min_x..tile.max_x {
                let x = dbx + tile.dst_x - p.clip_x0 + p.offset_x;
                if x < dst.width {
                    dst.set(x, y, buf.dst.get(dbx, dby));
                }
            }
        }
    }
}

/// One-shot resample that builds its own fractal noise table when needed.
pub fn enlarge_plane<T: Pixel>(
    src: &Plane<T>,
    format: &Format,
    params: &EnlargeParams,
) -> EnlargeResult<Plane<T>> {
    let mut enlarger = Enlarger::new(format, params)?;
    let mut dst = enlarger.allocate_output()?;
    let noise = (params.fractal_noise > 0 && !enlarger.only_shrinking())
        .then(|| FractalNoiseTable::new(enlarger.placement().scale_x));
    enlarger.run(src, &mut dst, noise.as_ref(), None, &mut |_| {})?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rgb;

    fn quiet() -> EnlargeParams {
        EnlargeParams {
            denoise: 0,
            dither: 0,
            ..EnlargeParams::default()
        }
    }

    fn pattern(width: usize, height: usize) -> Plane<Rgb> {
        let data = (0..width * height)
            .map(|i| {
                let (x, y) = ((i % width) as f32, (i / width) as f32);
                let edge = if (x - 0.6 * y) > 10.0 { 0.7 } else { 0.15 };
                Rgb::new(edge, 0.3 + 0.2 * (x * 0.3).sin(), 0.5 + 0.3 * (y * 0.17).cos())
            })
            .collect();
        Plane::from_vec(width, height, data)
    }

    #[test]
    fn flat_gray_stays_flat() {
        let src = Plane::filled(40, 30, Rgb::splat(0.5));
        let params = EnlargeParams {
            dither: 0,
            ..EnlargeParams::default()
        };
        let out = enlarge_plane(&src, &Format::uniform(40, 30, 2.0), &params).unwrap();
        assert_eq!((out.width, out.height), (80, 60));
        for p in out.pixels() {
            assert!((p.r - 0.5).abs() < 1.0 / 255.0, "{p:?}");
        }
    }

    #[test]
    fn output_stays_in_unit_range() {
        let src = pattern(37, 29);
        let params = EnlargeParams {
            fractal_noise: 60,
            pre_sharpen: 80,
            ..EnlargeParams::default()
        };
        let out = enlarge_plane(&src, &Format::new(37, 29, 2.7, 1.9), &params).unwrap();
        for p in out.pixels() {
            for c in [p.r, p.g, p.b] {
                assert!((0.0..=1.0).contains(&c));
            }
        }
    }

    #[test]
    fn mean_colour_is_preserved() {
        let src = pattern(32, 32);
        let out = enlarge_plane(&src, &Format::uniform(32, 32, 2.0), &quiet()).unwrap();
        let mean = |plane: &Plane<Rgb>| {
            plane.pixels().iter().map(|p| p.g as f64).sum::<f64>() / plane.data.len() as f64
        };
        assert!((mean(&src) - mean(&out)).abs() < 0.02);
    }

    #[test]
    fn clip_matches_full_run_subregion() {
        let src = pattern(60, 40);
        let full_format = Format::uniform(60, 40, 2.0);
        let full = enlarge_plane(&src, &full_format, &quiet()).unwrap();
        // Starts left of and above the destination, so tile origins line up.
        let clipped_format = full_format.with_dst_clip(-16, -8, 70, 50);
        let clipped = enlarge_plane(&src, &clipped_format, &quiet()).unwrap();
        assert_eq!((clipped.width, clipped.height), (86, 58));
        for y in 0..58 {
            for x in 0..86 {
                let got = clipped.get(x, y);
                if x < 16 || y < 8 {
                    assert_eq!(got, Rgb::zero());
                } else {
                    assert_eq!(got, full.get(x - 16, y - 8), "({x},{y})");
                }
            }
        }
    }

    #[test]
    fn cancel_before_first_tile() {
        let src = pattern(20, 20);
        let mut enlarger = Enlarger::<Rgb>::new(&Format::uniform(20, 20, 2.0), &quiet()).unwrap();
        let mut dst = enlarger.allocate_output().unwrap();
        let cancel = || true;
        let result = enlarger.run(&src, &mut dst, None, Some(&cancel), &mut |_| {});
        assert!(matches!(result, Err(EnlargeError::Cancelled)));
        assert!(dst.pixels().iter().all(|&p| p == Rgb::zero()));
    }

    #[test]
    fn progress_is_monotonic_and_complete() {
        let src = pattern(300, 20);
        let mut enlarger = Enlarger::<Rgb>::new(&Format::uniform(300, 20, 2.0), &quiet()).unwrap();
        let mut dst = enlarger.allocate_output().unwrap();
        let mut seen = Vec::new();
        enlarger
            .run(&src, &mut dst, None, None, &mut |f| seen.push(f))
            .unwrap();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn shrinking_takes_the_area_path() {
        let src = Plane::filled(40, 40, 0.25f32);
        let out = enlarge_plane(&src, &Format::uniform(40, 40, 0.5), &quiet()).unwrap();
        assert_eq!((out.width, out.height), (20, 20));
        assert!(out.pixels().iter().all(|v| (v - 0.25).abs() < 1e-5));
    }

    #[test]
    fn oversized_output_reports_alloc_failure() {
        let format = Format::uniform(10, 10, 2.0).with_dst_clip(0, 0, i32::MAX, i32::MAX);
        let enlarger = Enlarger::<Rgb>::new(&format, &quiet()).unwrap();
        assert!(matches!(
            enlarger.allocate_output(),
            Err(EnlargeError::Alloc { .. })
        ));
    }

    #[test]
    fn rejects_invalid_format() {
        let src = Plane::<f32>::new(4, 4);
        let err = enlarge_plane(&src, &Format::uniform(4, 4, -1.0), &quiet()).unwrap_err();
        assert!(matches!(err, EnlargeError::Params(_)));
    }
}
