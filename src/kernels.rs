//! Precomputed resampling kernels and lookup tables.

use crate::model::Coefficients;

/// Sub-steps per destination pixel used when integrating kernel shapes.
pub const FINE_EXP: u32 = 4;
pub const DIFF_TAB_LEN: usize = 1000;
pub const INV_TAB_LEN: usize = 10_000;

const ENLARGE_RADIUS: f32 = 1.8;
const SELECT_RADIUS: f32 = 1.9;

pub type Taps = [f32; 5];

#[derive(Clone, Copy, Debug)]
pub enum KernelShape {
    /// `exp(2 - 1/(1+x) - 1/(1-x))`, a smooth bump vanishing at the ends.
    SoftBump,
    /// `1 - x^4`.
    Quartic,
}

impl KernelShape {
    fn radius(self) -> f32 {
        match self {
            KernelShape::SoftBump => ENLARGE_RADIUS,
            KernelShape::Quartic => SELECT_RADIUS,
        }
    }

    fn eval(self, x: f64) -> f64 {
        match self {
            KernelShape::SoftBump => (2.0 - 1.0 / (1.0 + x + 1e-8) - 1.0 / (1.0 - x + 1e-8)).exp(),
            KernelShape::Quartic => 1.0 - x * x * x * x,
        }
    }

    /// Normalised cumulative table of the shape sampled at `len` points on `[-1, 1]`.
    fn integral_table(self, len: usize) -> Vec<f32> {
        let mut sum = 0.0f64;
        let mut cumulative = Vec::with_capacity(len);
        for n in 0..len {
            let x = 2.0 * n as f64 / (len - 1) as f64 - 1.0;
            sum += self.eval(x).max(0.0);
            cumulative.push(sum);
        }
        let norm = if sum > 0.0 { 1.0 / sum } else { 0.0 };
        cumulative.into_iter().map(|v| (v * norm) as f32).collect()
    }
}

/// Five-tap kernels for every destination index along one axis.
///
/// Tap `a` of kernel `p` weighs source index `int(p / scale) - 2 + a`.
#[derive(Clone, Debug)]
pub struct AxisKernels {
    taps: Vec<Taps>,
}

impl AxisKernels {
    pub fn new(shape: KernelShape, scale: f32, dst_len: usize) -> Self {
        let fine = 1i64 << FINE_EXP;
        let len = (2 * (fine as f32 * shape.radius() * scale) as usize + 1).max(3);
        let integral = shape.integral_table(len);
        let inv_scale = 1.0 / scale;
        let last = len as i64 - 1;

        let taps = (0..dst_len)
            .map(|p| {
                let big = (p as f32 * inv_scale) as i64;
                let start = ((p as i64) << FINE_EXP) + (fine >> 1) - (len as i64 >> 1);
                let mut ker = [0.0f32; 5];
                for (a, tap) in ker.iter_mut().enumerate() {
                    let src = big - 2 + a as i64;
                    let left = ((src * fine) as f32 * scale) as i64 - start;
                    let right = (((src + 1) * fine) as f32 * scale) as i64 - start;
                    let left = left.clamp(0, last) as usize;
                    let right = right.clamp(0, last) as usize;
                    *tap = integral[right] - integral[left];
                }
                normalize(&mut ker);
                ker
            })
            .collect();
        Self { taps }
    }

    /// Taps for destination index `p`; indices past the end fall back to kernel 0.
    #[inline]
    pub fn get(&self, p: usize) -> &Taps {
        self.taps.get(p).unwrap_or(&self.taps[0])
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}

// Absorbs the clamped table tails so every kernel sums to one.
fn normalize(ker: &mut Taps) {
    let sum: f32 = ker.iter().sum();
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for tap in ker.iter_mut() {
            *tap *= inv;
        }
    }
}

/// Enlarge and select kernels for both axes.
#[derive(Clone, Debug)]
pub struct KernelSet {
    pub enlarge_x: AxisKernels,
    pub enlarge_y: AxisKernels,
    pub select_x: AxisKernels,
    pub select_y: AxisKernels,
}

impl KernelSet {
    pub fn new(scale_x: f32, scale_y: f32, dst_width: usize, dst_height: usize) -> Self {
        let dst_width = dst_width.max(1);
        let dst_height = dst_height.max(1);
        Self {
            enlarge_x: AxisKernels::new(KernelShape::SoftBump, scale_x, dst_width),
            enlarge_y: AxisKernels::new(KernelShape::SoftBump, scale_y, dst_height),
            select_x: AxisKernels::new(KernelShape::Quartic, scale_x, dst_width),
            select_y: AxisKernels::new(KernelShape::Quartic, scale_y, dst_height),
        }
    }
}

/// Similarity and centre-bias lookup tables shaped by the coefficients.
#[derive(Clone, Debug)]
pub struct DiffTables {
    select: Vec<f32>,
    center: Vec<f32>,
}

impl DiffTables {
    pub fn new(coeffs: &Coefficients) -> Self {
        let mut select = Vec::with_capacity(DIFF_TAB_LEN);
        let mut center = Vec::with_capacity(DIFF_TAB_LEN);
        for a in 0..DIFF_TAB_LEN {
            let w0 = a as f32 / DIFF_TAB_LEN as f32;
            let w = (1.0 - w0).max(0.0);
            let w = w * w * (3.0 - 2.0 * w);
            select.push(w.powf(coeffs.select_peak_exp));
            center.push(1.0 + coeffs.center_weight_f * w0.powf(coeffs.center_w_exp));
        }
        Self { select, center }
    }

    /// Decreasing weight for a colour distance `d >= 0`.
    #[inline]
    pub fn select_weight(&self, d: f32) -> f32 {
        if d >= 1.0 {
            self.select[DIFF_TAB_LEN - 1]
        } else {
            self.select[(d.max(0.0) * (DIFF_TAB_LEN - 1) as f32) as usize]
        }
    }

    /// Bias for a squared distance from the true destination position.
    #[inline]
    pub fn center_weight(&self, dist_sq: f32) -> f32 {
        let dd = 1.0 - dist_sq / 1.5;
        if dd < 0.0 {
            self.center[0]
        } else {
            self.center[(dd.min(1.0) * (DIFF_TAB_LEN - 1) as f32) as usize]
        }
    }
}

/// Table-driven reciprocal, accurate to a few parts in ten thousand.
#[derive(Clone, Debug)]
pub struct InverseTable {
    tab: Vec<f32>,
}

impl Default for InverseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InverseTable {
    pub fn new() -> Self {
        let last = (INV_TAB_LEN - 1) as f32;
        let tab = (0..INV_TAB_LEN)
            .map(|a| if a == 0 { 1.0e6 } else { last / a as f32 })
            .collect();
        Self { tab }
    }

    #[inline]
    fn lookup(&self, x: f32) -> f32 {
        let idx = (x * (INV_TAB_LEN - 1) as f32 + 0.5) as usize;
        self.tab[idx.min(INV_TAB_LEN - 1)]
    }

    /// Approximates `1 / x` for `x >= 0`.
    pub fn inverse(&self, x: f32) -> f32 {
        if x < 0.001 {
            1000.0 * self.lookup(x * 1000.0)
        } else if x >= 1.0 {
            let mut x = x * 0.01;
            if x >= 1.0 {
                x *= 0.01;
                if x > 1.0 {
                    return 0.0001 / x;
                }
                return 0.0001 * self.lookup(x);
            }
            0.01 * self.lookup(x)
        } else {
            self.lookup(x)
        }
    }
}
