use crate::params::EnlargeParams;

const TABLE_LEN: usize = 7;

// Rows run from sharpest (index 0) to softest; `_FLAT0` is used at
// flatness 0 and `_FLAT1` at flatness 1.
const SHARP_EXP_FLAT0: [f32; TABLE_LEN] = [16.0, 6.0, 4.0, 2.0, 1.0, 0.5, 0.1];
const SHARP_EXP_FLAT1: [f32; TABLE_LEN] = [12.0, 5.0, 2.5, 1.0, 0.5, 0.1, 0.01];
const CENTER_WEIGHT_FLAT0: [f32; TABLE_LEN] = [8.0, 7.5, 7.0, 5.0, 3.0, 2.0, 1.0];
const CENTER_WEIGHT_FLAT1: [f32; TABLE_LEN] = [8.0, 7.0, 5.0, 3.0, 2.0, 1.0, 1.0];
const CENTER_EXP_FLAT0: [f32; TABLE_LEN] = [6.0, 5.5, 5.0, 4.5, 4.0, 3.0, 2.0];
const CENTER_EXP_FLAT1: [f32; TABLE_LEN] = [6.0, 5.0, 4.5, 4.0, 3.0, 2.0, 2.0];
const SELECT_PEAK_FLAT0: [f32; TABLE_LEN] = [4.0, 4.0, 3.5, 2.5, 1.5, 1.2, 1.0];
const SELECT_PEAK_FLAT1: [f32; TABLE_LEN] = [4.0, 3.5, 2.5, 1.5, 1.2, 1.0, 1.0];

/// Continuous engine coefficients derived from the integer sliders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub sharpness: f32,
    pub flatness: f32,
    pub denoise: f32,
    pub pre_sharpen: f32,
    pub dither: f32,
    pub fract: f32,

    pub sharp_exp: f32,
    pub center_weight_f: f32,
    pub center_w_exp: f32,
    pub select_peak_exp: f32,

    pub deriv_f: f32,
    pub deriv_diff_f: f32,
    pub line_neg_f: f32,
    pub line_pos_f: f32,
}

pub fn derive_coefficients(params: &EnlargeParams) -> Coefficients {
    let sharpness = ((params.sharpness as f32 + 1.0) * 0.01).clamp(0.0, 1.0);
    let flatness = (params.flatness as f32 * 0.01).clamp(0.0, 1.0);
    let g = params.fractal_noise as f32 * 0.01;

    let t = (1.0 - sharpness) * (TABLE_LEN - 1) as f32;
    let idx = (t as usize).min(TABLE_LEN - 2);
    let t = t - idx as f32;

    let blend = |flat0: &[f32; TABLE_LEN], flat1: &[f32; TABLE_LEN]| {
        let lo = flat0[idx] * (1.0 - t) + flat0[idx + 1] * t;
        let hi = flat1[idx] * (1.0 - t) + flat1[idx + 1] * t;
        hi * flatness + lo * (1.0 - flatness)
    };

    Coefficients {
        sharpness,
        flatness,
        denoise: params.denoise as f32 * 0.02,
        pre_sharpen: params.pre_sharpen as f32 * 0.01,
        dither: params.dither as f32 * 0.01,
        fract: 0.5 * g * (3.0 - g),

        sharp_exp: blend(&SHARP_EXP_FLAT0, &SHARP_EXP_FLAT1),
        center_weight_f: blend(&CENTER_WEIGHT_FLAT0, &CENTER_WEIGHT_FLAT1),
        center_w_exp: blend(&CENTER_EXP_FLAT0, &CENTER_EXP_FLAT1),
        select_peak_exp: blend(&SELECT_PEAK_FLAT0, &SELECT_PEAK_FLAT1),

        deriv_f: 1.0 - flatness,
        deriv_diff_f: 0.7,
        line_neg_f: 1.0,
        line_pos_f: 0.15,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_pure() {
        let params = EnlargeParams {
            sharpness: 37,
            flatness: 64,
            denoise: 5,
            pre_sharpen: 12,
            dither: 0,
            fractal_noise: 40,
        };
        assert_eq!(derive_coefficients(&params), derive_coefficients(&params));
    }

    #[test]
    fn extreme_sliders_stay_in_table_range() {
        for sharpness in [0u8, 50, 99, 100] {
            for flatness in [0u8, 100] {
                let c = derive_coefficients(&EnlargeParams {
                    sharpness,
                    flatness,
                    ..EnlargeParams::default()
                });
                assert!(c.sharp_exp >= 0.01 && c.sharp_exp <= 16.0, "{c:?}");
                assert!(c.select_peak_exp >= 1.0 && c.select_peak_exp <= 4.0);
                assert!(c.center_w_exp >= 2.0 && c.center_w_exp <= 6.0);
            }
        }
    }

    #[test]
    fn full_sharpness_hits_first_table_row() {
        let c = derive_coefficients(&EnlargeParams {
            sharpness: 100,
            flatness: 0,
            ..EnlargeParams::default()
        });
        assert_eq!(c.sharp_exp, 16.0);
        assert_eq!(c.center_weight_f, 8.0);
        assert_eq!(c.deriv_f, 1.0);
    }

    #[test]
    fn flatness_blends_between_tables() {
        let c = derive_coefficients(&EnlargeParams {
            sharpness: 100,
            flatness: 50,
            ..EnlargeParams::default()
        });
        assert!((c.sharp_exp - 14.0).abs() < 1e-5);
        assert!((c.deriv_f - 0.5).abs() < 1e-6);
    }

    #[test]
    fn linear_sliders_scale() {
        let c = derive_coefficients(&EnlargeParams {
            denoise: 50,
            dither: 30,
            fractal_noise: 100,
            ..EnlargeParams::default()
        });
        assert!((c.denoise - 1.0).abs() < 1e-6);
        assert!((c.dither - 0.3).abs() < 1e-6);
        assert!((c.fract - 1.0).abs() < 1e-6);
    }
}
