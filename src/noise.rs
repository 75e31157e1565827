use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::plane::Plane;
use crate::rng;

pub const NOISE_EXP: u32 = 9;
pub const NOISE_LEN: usize = 1 << NOISE_EXP;
const NOISE_MASK: i64 = NOISE_LEN as i64 - 1;
const START_EXP: u32 = 2;

const PERM_LEN: usize = 1 << 12;
const PERM_MASK: i64 = PERM_LEN as i64 - 1;

/// Tileable multi-octave noise field used for the grain effect.
///
/// Built by repeatedly doubling a tiny torus and adding uniform noise whose
/// amplitude falls off with each octave; octaves finer than the enlargement
/// scale are faded in smoothly so the grain size follows the zoom.
#[derive(Debug, Clone)]
pub struct FractalNoiseTable {
    scale: f32,
    table: Plane<f32>,
    perm: Vec<i32>,
}

impl FractalNoiseTable {
    pub fn new(scale: f32) -> Self {
        Self::with_seed(scale, rng::DEFAULT_SEED)
    }

    pub fn with_seed(scale: f32, seed: u64) -> Self {
        let mut rng = rng::noise_rng(seed);

        let mut perm: Vec<i32> = (0..PERM_LEN as i32).collect();
        perm.shuffle(&mut rng);

        let start = 1usize << START_EXP;
        let mut table = Plane::<f32>::new(start, start);
        let mut ratio = scale / (1u32 << (NOISE_EXP - START_EXP)) as f32;
        for s in 0..(NOISE_EXP - START_EXP) {
            table = table.smooth_double_torus();
            ratio *= 2.0;
            let mut amplitude = 2.0 * ratio;
            if amplitude > 1.0 {
                amplitude = 1.0;
            } else {
                amplitude = amplitude * amplitude * (3.0 - 2.0 * amplitude);
            }
            amplitude *= 1.5 * 2f32.powi(-1 - s as i32);
            let width = table.width;
            table
                .pixels_mut()
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    let mut rng = rng::octave_row_rng(seed, s, y);
                    for value in row {
                        *value += (rng.random::<f32>() - 0.5) * amplitude;
                    }
                });
        }
        table.scale(1000.0 / scale);

        Self { scale, table, perm }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Value at `(x, y)` with both coordinates wrapped onto the table.
    #[inline]
    pub fn get(&self, x: i64, y: i64) -> f32 {
        self.table
            .get((x & NOISE_MASK) as usize, (y & NOISE_MASK) as usize)
    }

    /// Pseudo-random kernel centre derived from the seed pair `(x, y)`.
    ///
    /// Returns the wrapped centre and the table value there.
    pub fn kernel_center(&self, x: i64, y: i64) -> (i64, i64, f32) {
        let r1 = (x >> 8) + self.permute(x);
        let r2 = (y >> 8) + self.permute(y);
        let r1 = self.permute(r1 ^ r2);
        let r2 = self.permute(r1 + r2);
        let (cx, cy) = (r1 & NOISE_MASK, r2 & NOISE_MASK);
        (cx, cy, self.get(cx, cy))
    }

    #[inline]
    fn permute(&self, r: i64) -> i64 {
        self.perm[(r & PERM_MASK) as usize] as i64
    }
}
