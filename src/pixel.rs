use std::ops::{Add, AddAssign, Mul, MulAssign, Sub, SubAssign};

/// Numeric contract shared by every value stored in a [`Plane`](crate::plane::Plane).
///
/// Implemented for a scalar (`f32`), three-channel [`Rgb`] and four-channel
/// [`Rgba`]. The engine is generic over this trait and monomorphised per
/// layout, so inner loops never go through dynamic dispatch.
pub trait Pixel:
    Copy
    + Default
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<f32, Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign<f32>
{
    #[inline]
    fn zero() -> Self {
        Self::default()
    }

    /// Mean absolute channel value.
    fn norm1(&self) -> f32;

    /// Clamps every channel to the unit range.
    fn clip(&self) -> Self;

    #[inline]
    fn add_mul(&mut self, other: Self, factor: f32) {
        *self += other * factor;
    }

    /// Multiplies each colour channel `c` by `1 + w * min(max_w, c, 1 - c)`.
    ///
    /// With `|w| <= 1` a channel inside `[0, 1]` stays inside it. Alpha is left
    /// untouched.
    fn perturb(&mut self, w: f32, max_w: f32);
}

#[inline]
fn perturb_channel(c: &mut f32, w: f32, max_w: f32) {
    let bound = max_w.min(*c).min(1.0 - *c);
    *c += w * bound * *c;
}

impl Pixel for f32 {
    #[inline]
    fn norm1(&self) -> f32 {
        self.abs()
    }

    #[inline]
    fn clip(&self) -> Self {
        self.clamp(0.0, 1.0)
    }

    #[inline]
    fn perturb(&mut self, w: f32, max_w: f32) {
        perturb_channel(self, w, max_w);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub const fn splat(v: f32) -> Self {
        Self { r: v, g: v, b: v }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

macro_rules! channel_ops {
    ($ty:ident { $($field:ident),+ }) => {
        impl Add for $ty {
            type Output = Self;
            #[inline]
            fn add(self, rhs: Self) -> Self {
                Self { $($field: self.$field + rhs.$field),+ }
            }
        }

        impl Sub for $ty {
            type Output = Self;
            #[inline]
            fn sub(self, rhs: Self) -> Self {
                Self { $($field: self.$field - rhs.$field),+ }
            }
        }

        impl Mul<f32> for $ty {
            type Output = Self;
            #[inline]
            fn mul(self, rhs: f32) -> Self {
                Self { $($field: self.$field * rhs),+ }
            }
        }

        impl AddAssign for $ty {
            #[inline]
            fn add_assign(&mut self, rhs: Self) {
                $(self.$field += rhs.$field;)+
            }
        }

        impl SubAssign for $ty {
            #[inline]
            fn sub_assign(&mut self, rhs: Self) {
                $(self.$field -= rhs.$field;)+
            }
        }

        impl MulAssign<f32> for $ty {
            #[inline]
            fn mul_assign(&mut self, rhs: f32) {
                $(self.$field *= rhs;)+
            }
        }
    };
}

channel_ops!(Rgb { r, g, b });
channel_ops!(Rgba { r, g, b, a });

impl Pixel for Rgb {
    #[inline]
    fn norm1(&self) -> f32 {
        (self.r.abs() + self.g.abs() + self.b.abs()) * (1.0 / 3.0)
    }

    #[inline]
    fn clip(&self) -> Self {
        Self::new(self.r.clip(), self.g.clip(), self.b.clip())
    }

    #[inline]
    fn perturb(&mut self, w: f32, max_w: f32) {
        perturb_channel(&mut self.r, w, max_w);
        perturb_channel(&mut self.g, w, max_w);
        perturb_channel(&mut self.b, w, max_w);
    }
}

impl Pixel for Rgba {
    #[inline]
    fn norm1(&self) -> f32 {
        (self.r.abs() + self.g.abs() + self.b.abs() + self.a.abs()) * 0.25
    }

    #[inline]
    fn clip(&self) -> Self {
        Self::new(self.r.clip(), self.g.clip(), self.b.clip(), self.a.clip())
    }

    #[inline]
    fn perturb(&mut self, w: f32, max_w: f32) {
        perturb_channel(&mut self.r, w, max_w);
        perturb_channel(&mut self.g, w, max_w);
        perturb_channel(&mut self.b, w, max_w);
    }
}
