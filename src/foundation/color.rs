/// Premultiplied-alpha RGBA8 color. The storage convention everywhere in the
/// pipeline: channel values are already multiplied by alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Self = Self {
        r: 0,
        g: 0,
        b: 0,
        a: 0,
    };
    pub const WHITE: Self = Self {
        r: 255,
        g: 255,
        b: 255,
        a: 255,
    };

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Premultiplies a straight-alpha color.
    pub fn from_straight(r: u8, g: u8, b: u8, a: u8) -> Self {
        let mul = |c: u8| ((c as u16 * a as u16 + 127) / 255) as u8;
        Self {
            r: mul(r),
            g: mul(g),
            b: mul(b),
            a,
        }
    }
}

/// Per-channel multiplier applied directly to premultiplied RGBA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorScale {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Default for ColorScale {
    fn default() -> Self {
        Self::ONE
    }
}

impl ColorScale {
    pub const ONE: Self = Self {
        r: 1.0,
        g: 1.0,
        b: 1.0,
        a: 1.0,
    };

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn mul(self, other: ColorScale) -> Self {
        Self {
            r: self.r * other.r,
            g: self.g * other.g,
            b: self.b * other.b,
            a: self.a * other.a,
        }
    }

    pub fn is_one(self) -> bool {
        self == Self::ONE
    }
}

/// Row-major 4x5 affine transform on straight-alpha RGBA.
///
/// `out = body * in + translate`, where `body` is the leading 4x4 block. The
/// matrix operates on un-premultiplied color: executors unpremultiply, apply,
/// clamp, and re-premultiply. `ColorMatrix::scale(r, g, b, a)` is therefore
/// equivalent to `ColorScale::new(r * a, g * a, b * a, a)` on premultiplied
/// pixels, which the mipmap layer exploits to fold scale-only matrices into
/// per-vertex color scales.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix {
    /// 4x4 channel-mix block, row-major.
    pub body: [f32; 16],
    /// Per-channel additive term (the fifth column).
    pub translate: [f32; 4],
}

impl Default for ColorMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl ColorMatrix {
    pub const IDENTITY: Self = Self {
        body: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
        translate: [0.0; 4],
    };

    pub fn scale(r: f32, g: f32, b: f32, a: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.body[0] = r;
        m.body[5] = g;
        m.body[10] = b;
        m.body[15] = a;
        m
    }

    pub fn translate(r: f32, g: f32, b: f32, a: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.translate = [r, g, b, a];
        m
    }

    /// `self` applied after `other`.
    pub fn concat(self, other: ColorMatrix) -> Self {
        let mut body = [0.0f32; 16];
        for row in 0..4 {
            for col in 0..4 {
                let mut sum = 0.0;
                for k in 0..4 {
                    sum += self.body[row * 4 + k] * other.body[k * 4 + col];
                }
                body[row * 4 + col] = sum;
            }
        }
        let mut translate = [0.0f32; 4];
        for row in 0..4 {
            let mut sum = self.translate[row];
            for k in 0..4 {
                sum += self.body[row * 4 + k] * other.translate[k];
            }
            translate[row] = sum;
        }
        Self { body, translate }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// True when the matrix only scales the diagonal with no translation.
    pub fn is_scale_only(&self) -> bool {
        if self.translate != [0.0; 4] {
            return false;
        }
        for row in 0..4 {
            for col in 0..4 {
                if row != col && self.body[row * 4 + col] != 0.0 {
                    return false;
                }
            }
        }
        true
    }

    /// Diagonal elements, meaningful when [`is_scale_only`](Self::is_scale_only).
    pub fn scale_elements(&self) -> (f32, f32, f32, f32) {
        (self.body[0], self.body[5], self.body[10], self.body[15])
    }

    /// Applies the matrix to a straight-alpha RGBA value in [0, 1].
    pub fn apply(&self, rgba: [f32; 4]) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        for (row, slot) in out.iter_mut().enumerate() {
            let mut sum = self.translate[row];
            for col in 0..4 {
                sum += self.body[row * 4 + col] * rgba[col];
            }
            *slot = sum;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_straight_premultiplies() {
        let c = Color::from_straight(255, 128, 0, 128);
        assert_eq!(c, Color::new(128, 64, 0, 128));
    }

    #[test]
    fn scale_only_detection() {
        assert!(ColorMatrix::IDENTITY.is_scale_only());
        assert!(ColorMatrix::scale(0.5, 0.5, 0.5, 1.0).is_scale_only());
        assert!(!ColorMatrix::translate(0.1, 0.0, 0.0, 0.0).is_scale_only());
        let (r, g, b, a) = ColorMatrix::scale(0.25, 0.5, 0.75, 1.0).scale_elements();
        assert_eq!((r, g, b, a), (0.25, 0.5, 0.75, 1.0));
    }

    #[test]
    fn concat_applies_right_then_left() {
        let double = ColorMatrix::scale(2.0, 2.0, 2.0, 1.0);
        let shift = ColorMatrix::translate(0.1, 0.0, 0.0, 0.0);
        let m = shift.concat(double);
        let out = m.apply([0.25, 0.0, 0.0, 1.0]);
        assert!((out[0] - 0.6).abs() < 1e-6);

        let m2 = double.concat(shift);
        let out2 = m2.apply([0.25, 0.0, 0.0, 1.0]);
        assert!((out2[0] - 0.7).abs() < 1e-6);
    }
}
