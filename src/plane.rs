use std::mem;

use crate::format::{Format, Placement};
use crate::pixel::Pixel;
use crate::shrink::shrink_clip;
use crate::{EnlargeError, EnlargeResult};

/// Row-major rectangular buffer of pixel values.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane<T> {
    pub width: usize,
    pub height: usize,
    pub data: Vec<T>,
}

impl<T: Pixel> Plane<T> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![T::zero(); width * height],
        }
    }

    /// Allocates a zeroed plane, reporting allocation failure instead of aborting.
    pub fn try_new(width: usize, height: usize) -> EnlargeResult<Self> {
        let len = width
            .checked_mul(height)
            .ok_or(EnlargeError::Alloc { bytes: usize::MAX })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| EnlargeError::Alloc {
            bytes: len.saturating_mul(mem::size_of::<T>()),
        })?;
        data.resize(len, T::zero());
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(width * height, data.len());
        Self {
            width,
            height,
            data,
        }
    }

    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    #[inline]
    pub fn add(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] += value;
    }

    #[inline]
    pub fn sub(&mut self, x: usize, y: usize, value: T) {
        let idx = self.index(x, y);
        self.data[idx] -= value;
    }

    #[inline]
    pub fn mul(&mut self, x: usize, y: usize, factor: f32) {
        let idx = self.index(x, y);
        self.data[idx] *= factor;
    }

    /// Reads with edge replication for coordinates outside the plane.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> T {
        if self.is_empty() {
            return T::zero();
        }
        let xi = x.clamp(0, self.width as isize - 1) as usize;
        let yi = y.clamp(0, self.height as isize - 1) as usize;
        self.get(xi, yi)
    }

    pub fn pixels(&self) -> &[T] {
        self.data.as_slice()
    }

    pub fn pixels_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    // Stencils below expect 1 <= x < width-1 and 1 <= y < height-1.

    #[inline]
    pub fn dx(&self, x: usize, y: usize) -> T {
        (self.get(x + 1, y) - self.get(x - 1, y)) * 0.5
    }

    #[inline]
    pub fn dy(&self, x: usize, y: usize) -> T {
        (self.get(x, y + 1) - self.get(x, y - 1)) * 0.5
    }

    #[inline]
    pub fn d2x(&self, x: usize, y: usize) -> T {
        self.get(x + 1, y) + self.get(x - 1, y) - self.get(x, y) * 2.0
    }

    #[inline]
    pub fn d2y(&self, x: usize, y: usize) -> T {
        self.get(x, y + 1) + self.get(x, y - 1) - self.get(x, y) * 2.0
    }

    #[inline]
    pub fn dxy(&self, x: usize, y: usize) -> T {
        (self.get(x + 1, y + 1) - self.get(x - 1, y + 1) - self.get(x + 1, y - 1)
            + self.get(x - 1, y - 1))
            * 0.25
    }

    /// Weighted 3x3 neighbourhood mean minus the centre value.
    #[inline]
    pub fn laplace(&self, x: usize, y: usize) -> T {
        self.neighbour_mean(x, y) - self.get(x, y)
    }

    #[inline]
    fn neighbour_mean(&self, x: usize, y: usize) -> T {
        let edges =
            self.get(x, y - 1) + self.get(x - 1, y) + self.get(x + 1, y) + self.get(x, y + 1);
        let corners = self.get(x - 1, y - 1)
            + self.get(x + 1, y - 1)
            + self.get(x - 1, y + 1)
            + self.get(x + 1, y + 1);
        (edges * 2.0 + corners) * (1.0 / 12.0)
    }

    /// Fills `self` from `src` starting at `(x0, y0)` in source coordinates,
    /// replicating the nearest edge pixel wherever the window leaves `src`.
    pub fn copy_from(&mut self, src: &Plane<T>, x0: isize, y0: isize) {
        let width = self.width;
        for (y, row) in self.data.chunks_exact_mut(width.max(1)).enumerate() {
            let sy = y0 + y as isize;
            for (x, value) in row.iter_mut().enumerate() {
                *value = src.get_clamped(x0 + x as isize, sy);
            }
        }
    }

    pub fn clip(&self, x0: isize, y0: isize, width: usize, height: usize) -> Plane<T> {
        let mut out = Plane::new(width, height);
        out.copy_from(self, x0, y0);
        out
    }

    /// Doubles both dimensions with the `(5, 10, 1) / 16` interpolation kernel.
    pub fn smooth_double(&self) -> Plane<T> {
        self.smooth_double_with(Edge::Clamp)
    }

    /// Like [`smooth_double`](Self::smooth_double) but treats the plane as a torus.
    pub fn smooth_double_torus(&self) -> Plane<T> {
        self.smooth_double_with(Edge::Wrap)
    }

    fn smooth_double_with(&self, edge: Edge) -> Plane<T> {
        let mut rows = Plane::new(2 * self.width, self.height);
        let mut out = Plane::new(2 * self.width, 2 * self.height);
        self.smooth_double_into(edge, &mut rows, &mut out);
        out
    }

    // `rows` is 2w x h, `out` is 2w x 2h.
    fn smooth_double_into(&self, edge: Edge, rows: &mut Plane<T>, out: &mut Plane<T>) {
        let (w, h) = (self.width, self.height);
        if w == 0 || h == 0 {
            return;
        }
        for y in 0..h {
            for x in 0..w {
                let p0 = self.get(edge.index(x as isize - 1, w), y);
                let p1 = self.get(x, y);
                let p2 = self.get(edge.index(x as isize + 1, w), y);
                rows.set(2 * x, y, smooth3(p0, p1, p2));
                rows.set(2 * x + 1, y, smooth3(p2, p1, p0));
            }
        }
        for y in 0..h {
            let above = edge.index(y as isize - 1, h);
            let below = edge.index(y as isize + 1, h);
            for x in 0..2 * w {
                let p0 = rows.get(x, above);
                let p1 = rows.get(x, y);
                let p2 = rows.get(x, below);
                out.set(x, 2 * y, smooth3(p0, p1, p2));
                out.set(x, 2 * y + 1, smooth3(p2, p1, p0));
            }
        }
    }

    /// Averages 2x2 cells. A partial cell on an odd edge averages the pixels it
    /// actually covers.
    pub fn shrink_half(&self) -> Plane<T> {
        let mut out = Plane::new(self.width.div_ceil(2), self.height.div_ceil(2));
        let mut counts = vec![0u8; out.data.len()];
        self.shrink_half_into(&mut out, &mut counts);
        out
    }

    fn shrink_half_into(&self, out: &mut Plane<T>, counts: &mut [u8]) {
        out.fill(T::zero());
        counts.fill(0);
        let hw = out.width;
        for y in 0..self.height {
            for x in 0..self.width {
                out.add(x >> 1, y >> 1, self.get(x, y));
                counts[(y >> 1) * hw + (x >> 1)] += 1;
            }
        }
        for (value, &count) in out.data.iter_mut().zip(counts.iter()) {
            if count > 0 {
                *value *= 1.0 / count as f32;
            }
        }
    }

    /// Area-weighted box resampling to a smaller size.
    ///
    /// Every output sample is the mean of the source area it covers, so
    /// `sum(out) * (W / w) * (H / h) == sum(self)`. Sizes larger than the
    /// source are clamped to the source size.
    pub fn shrink(&self, width: usize, height: usize) -> Plane<T> {
        let width = width.clamp(1, self.width.max(1));
        let height = height.clamp(1, self.height.max(1));
        let mut out = Plane::new(width, height);
        if self.is_empty() {
            return out;
        }
        let format = Format::new(
            self.width,
            self.height,
            width as f32 / self.width as f32,
            height as f32 / self.height as f32,
        );
        // Without a cancel hook the area pass cannot fail.
        let _ = shrink_clip(self, &Placement::new(&format), &mut out, None, &mut |_| {});
        out
    }

    /// Returns the 1-2-1 x 1-2-1 blur of the interior; the one-pixel border is zero.
    pub fn smooth(&self) -> Plane<T> {
        let mut out = Plane::new(self.width, self.height);
        self.blur_interior_into(&mut out);
        out
    }

    pub fn smooth_into(&self, out: &mut Plane<T>) {
        out.fill(T::zero());
        self.blur_interior_into(out);
    }

    /// Replaces the interior with the 1-2-1 x 1-2-1 blur of `src`, which must
    /// match in size. The border keeps its values.
    pub fn smoothen_from(&mut self, src: &Plane<T>) {
        src.blur_interior_into(self);
    }

    fn blur_interior_into(&self, out: &mut Plane<T>) {
        if self.width < 3 || self.height < 3 {
            return;
        }
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                let top = self.get(x - 1, y - 1) + self.get(x, y - 1) * 2.0 + self.get(x + 1, y - 1);
                let mid = self.get(x - 1, y) + self.get(x, y) * 2.0 + self.get(x + 1, y);
                let bot = self.get(x - 1, y + 1) + self.get(x, y + 1) * 2.0 + self.get(x + 1, y + 1);
                out.set(x, y, (top + mid * 2.0 + bot) * 0.0625);
            }
        }
    }

    /// Splits off the low-frequency part and keeps the high residual in `self`.
    ///
    /// The low field is built by halving `levels` times, then doubling back with
    /// [`smooth_double`](Self::smooth_double) and cropping to the original size.
    pub fn split_low_frequency(&mut self, levels: u32) -> Plane<T> {
        if self.is_empty() {
            return Plane::new(self.width, self.height);
        }
        let mut low = self.clone();
        for _ in 0..levels {
            low = low.shrink_half();
        }
        for _ in 0..levels {
            low = low.smooth_double();
        }
        let low = low.clip(0, 0, self.width, self.height);
        self.sub_plane(&low);
        low
    }

    /// Unsharp mask against the 3x3 neighbourhood mean, interior only.
    pub fn sharpen(&mut self, strength: f32, scratch: &mut FilterScratch<T>) {
        if strength == 0.0 || self.width < 3 || self.height < 3 {
            return;
        }
        let boost = &mut scratch.detail;
        boost.fill(T::zero());
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                boost.set(x, y, self.laplace(x, y) * -strength);
            }
        }
        self.add_plane(boost);
    }

    /// Attenuates low-amplitude high-frequency detail while keeping edges.
    pub fn reduce_noise(&mut self, strength: f32, scratch: &mut FilterScratch<T>) {
        if strength <= 0.0 || self.is_empty() {
            return;
        }
        self.shrink_half_into(&mut scratch.half, &mut scratch.counts);
        scratch
            .half
            .smooth_double_into(Edge::Clamp, &mut scratch.rows, &mut scratch.doubled);
        let detail = &mut scratch.detail;
        detail.copy_from(&scratch.doubled, 0, 0);
        detail.scale(-1.0);
        detail.add_plane(self);

        let inv = 1.0 / strength;
        for p in &mut detail.data {
            let dd = p.norm1() * 5.0 * inv;
            *p = if dd < 1.0 {
                *p * (1.0 - noise_keep_weight(dd))
            } else {
                T::zero()
            };
        }
        self.sub_plane(detail);
    }

    pub fn clamp01(&mut self) {
        for value in &mut self.data {
            *value = value.clip();
        }
    }

    pub fn add_plane(&mut self, other: &Plane<T>) {
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    pub fn sub_plane(&mut self, other: &Plane<T>) {
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a -= b;
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for value in &mut self.data {
            *value *= factor;
        }
    }
}

/// Work buffers for [`Plane::sharpen`] and [`Plane::reduce_noise`], sized for
/// one plane shape and reused across tiles.
#[derive(Debug)]
pub struct FilterScratch<T> {
    detail: Plane<T>,
    half: Plane<T>,
    counts: Vec<u8>,
    rows: Plane<T>,
    doubled: Plane<T>,
}

impl<T: Pixel> FilterScratch<T> {
    pub fn try_new(width: usize, height: usize) -> EnlargeResult<Self> {
        let detail = Plane::try_new(width, height)?;
        let (hw, hh) = (width.div_ceil(2), height.div_ceil(2));
        let mut counts = Vec::new();
        counts
            .try_reserve_exact(hw * hh)
            .map_err(|_| EnlargeError::Alloc { bytes: hw * hh })?;
        counts.resize(hw * hh, 0);
        Ok(Self {
            detail,
            half: Plane::try_new(hw, hh)?,
            counts,
            rows: Plane::try_new(2 * hw, hh)?,
            doubled: Plane::try_new(2 * hw, 2 * hh)?,
        })
    }
}

impl Plane<f32> {
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }
}

// Share of the high-frequency residual kept for a normalised amplitude `dd` in [0, 1).
fn noise_keep_weight(dd: f32) -> f32 {
    let mut w = dd;
    w *= 2.0 - w;
    w *= 2.0 - w;
    w *= 2.0 - w;
    if w < 0.2 {
        w *= 5.0;
        w = 0.1 * w * w + 0.1;
    }
    1.1 * (w - 1.0) + 1.0
}

#[inline]
fn smooth3<T: Pixel>(p0: T, p1: T, p2: T) -> T {
    (p0 * 5.0 + p1 * 10.0 + p2) * 0.0625
}

#[derive(Clone, Copy)]
enum Edge {
    Clamp,
    Wrap,
}

impl Edge {
    #[inline]
    fn index(self, i: isize, len: usize) -> usize {
        match self {
            Edge::Clamp => i.clamp(0, len as isize - 1) as usize,
            Edge::Wrap => i.rem_euclid(len as isize) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rgb;

    fn ramp(width: usize, height: usize) -> Plane<f32> {
        let data = (0..width * height)
            .map(|i| ((i % width) as f32 * 0.1 + (i / width) as f32 * 0.03).sin() * 0.5 + 0.5)
            .collect();
        Plane::from_vec(width, height, data)
    }

    #[test]
    fn copy_from_replicates_edges() {
        let src = Plane::from_vec(2, 2, vec![1.0f32, 2.0, 3.0, 4.0]);
        let out = src.clip(-1, -1, 4, 4);
        assert_eq!(out.get(0, 0), 1.0);
        assert_eq!(out.get(3, 0), 2.0);
        assert_eq!(out.get(0, 3), 3.0);
        assert_eq!(out.get(3, 3), 4.0);
        assert_eq!(out.get(2, 2), 4.0);
    }

    #[test]
    fn derivative_stencils_on_quadratic() {
        // p = x^2 + 2xy
        let mut plane = Plane::<f32>::new(5, 5);
        for y in 0..5 {
            for x in 0..5 {
                let (fx, fy) = (x as f32, y as f32);
                plane.set(x, y, fx * fx + 2.0 * fx * fy);
            }
        }
        assert!((plane.dx(2, 2) - (2.0 * 2.0 + 2.0 * 2.0)).abs() < 1e-5);
        assert!((plane.dy(2, 2) - 4.0).abs() < 1e-5);
        assert!((plane.d2x(2, 2) - 2.0).abs() < 1e-5);
        assert!(plane.d2y(2, 2).abs() < 1e-5);
        assert!((plane.dxy(2, 2) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn smooth_double_keeps_constants() {
        let plane = Plane::filled(3, 4, Rgb::splat(0.25));
        let doubled = plane.smooth_double();
        assert_eq!((doubled.width, doubled.height), (6, 8));
        for p in doubled.pixels() {
            assert!((p.r - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn torus_doubling_wraps() {
        let mut plane = Plane::<f32>::new(4, 4);
        plane.set(0, 0, 1.0);
        let doubled = plane.smooth_double_torus();
        assert!(doubled.get(7, 7) > 0.0);
        let clamped = plane.smooth_double();
        assert_eq!(clamped.get(7, 7), 0.0);
    }

    #[test]
    fn shrink_conserves_energy() {
        let plane = ramp(37, 23);
        for &(w, h) in &[(10usize, 7usize), (18, 11), (36, 22), (5, 23)] {
            let small = plane.shrink(w, h);
            let area = (plane.width as f64 / w as f64) * (plane.height as f64 / h as f64);
            let lhs = small.sum() * area;
            let rhs = plane.sum();
            assert!(
                (lhs - rhs).abs() / rhs < 1e-3,
                "{w}x{h}: {lhs} vs {rhs}"
            );
        }
    }

    #[test]
    fn shrink_half_averages_partial_cells() {
        let plane = Plane::filled(5, 3, 0.5f32);
        let half = plane.shrink_half();
        assert_eq!((half.width, half.height), (3, 2));
        assert!(half.pixels().iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn split_low_frequency_is_exact_decomposition() {
        let original = ramp(20, 13);
        let mut high = original.clone();
        let low = high.split_low_frequency(2);
        for i in 0..original.data.len() {
            assert!((low.data[i] + high.data[i] - original.data[i]).abs() < 1e-6);
        }
        high.add_plane(&low);
        for (a, b) in high.data.iter().zip(original.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        high.sub_plane(&original);
        assert!(high.data.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn split_low_frequency_of_flat_field_has_no_residual() {
        let mut plane = Plane::filled(19, 11, 0.7f32);
        plane.split_low_frequency(1);
        assert!(plane.pixels().iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn smooth_zeroes_border_and_smoothen_from_keeps_it() {
        let plane = Plane::filled(4, 4, 1.0f32);
        let smoothed = plane.smooth();
        assert_eq!(smoothed.get(0, 0), 0.0);
        assert!((smoothed.get(1, 1) - 1.0).abs() < 1e-6);

        let mut spiked = plane.clone();
        spiked.set(1, 1, 5.0);
        let mut inplace = plane.clone();
        inplace.smoothen_from(&spiked);
        assert_eq!(inplace.get(0, 0), 1.0);
        assert!(inplace.get(1, 1) > 1.0 && inplace.get(1, 1) < 5.0);

        let mut reused = Plane::filled(4, 4, 9.0f32);
        plane.smooth_into(&mut reused);
        assert_eq!(reused, smoothed);
    }

    #[test]
    fn sharpen_leaves_flat_regions_alone() {
        let mut plane = Plane::filled(6, 6, 0.4f32);
        let mut scratch = FilterScratch::try_new(6, 6).unwrap();
        plane.sharpen(0.8, &mut scratch);
        assert!(plane.pixels().iter().all(|&v| (v - 0.4).abs() < 1e-6));
    }

    #[test]
    fn sharpen_amplifies_a_peak() {
        let mut plane = Plane::filled(5, 5, 0.4f32);
        plane.set(2, 2, 0.6);
        let mut scratch = FilterScratch::try_new(5, 5).unwrap();
        plane.sharpen(1.0, &mut scratch);
        assert!(plane.get(2, 2) > 0.6);
        assert!(plane.get(2, 1) < 0.4);
        assert_eq!(plane.get(0, 0), 0.4);
    }

    #[test]
    fn reduce_noise_damps_small_ripples_only() {
        let mut plane = Plane::<f32>::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                let ripple = if (x + y) % 2 == 0 { 0.004 } else { -0.004 };
                let edge = if x >= 8 { 0.5 } else { 0.0 };
                plane.set(x, y, 0.2 + ripple + edge);
            }
        }
        let before = plane.clone();
        let mut scratch = FilterScratch::try_new(16, 16).unwrap();
        plane.reduce_noise(0.4, &mut scratch);
        let ripple_before = (before.get(3, 3) - before.get(4, 3)).abs();
        let ripple_after = (plane.get(3, 3) - plane.get(4, 3)).abs();
        assert!(ripple_after < ripple_before);
        assert!((plane.get(12, 5) - plane.get(3, 5)) > 0.45);
    }

    #[test]
    fn reused_scratch_matches_the_detail_band() {
        let mut scratch = FilterScratch::try_new(21, 14).unwrap();
        // Leave stale content behind from an unrelated plane first.
        let mut other = Plane::filled(21, 14, 0.9f32);
        other.set(4, 4, 0.1);
        other.sharpen(0.7, &mut scratch);

        let original = ramp(21, 14);
        let mut high = original.clone();
        high.split_low_frequency(1);
        let mut expected = original.clone();
        for (value, &p) in expected.data.iter_mut().zip(high.data.iter()) {
            let dd = p.abs() * 5.0 * (1.0 / 0.3);
            if dd < 1.0 {
                *value -= p * (1.0 - noise_keep_weight(dd));
            }
        }

        let mut filtered = original.clone();
        filtered.reduce_noise(0.3, &mut scratch);
        for (a, b) in filtered.data.iter().zip(expected.data.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn filter_scratch_reports_overflow() {
        assert!(matches!(
            FilterScratch::<Rgb>::try_new(usize::MAX, 3),
            Err(EnlargeError::Alloc { .. })
        ));
    }

    #[test]
    fn try_new_reports_overflow() {
        assert!(matches!(
            Plane::<Rgb>::try_new(usize::MAX, 2),
            Err(EnlargeError::Alloc { .. })
        ));
    }
}
