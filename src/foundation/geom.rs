use kurbo::Affine;

/// Integer pixel rectangle used across all pipeline layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn sized(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn contains_point(self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    pub fn contains(self, other: Region) -> bool {
        if other.is_empty() {
            return true;
        }
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }

    pub fn intersects(self, other: Region) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    pub fn translated(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn intersection(self, other: Region) -> Option<Region> {
        if !self.intersects(other) {
            return None;
        }
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        Some(Region::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// 2x3 geometry matrix applied to destination coordinates of a draw.
///
/// Stored as the six affine coefficients; [`kurbo::Affine`] does the heavy
/// lifting for composition and rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoM {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for GeoM {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl GeoM {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: sy,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn translate(tx: f32, ty: f32) -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            tx,
            ty,
        }
    }

    pub fn rotate(theta: f32) -> Self {
        Self::from_affine(Affine::rotate(theta as f64))
    }

    pub fn from_affine(m: Affine) -> Self {
        let c = m.as_coeffs();
        Self {
            a: c[0] as f32,
            b: c[1] as f32,
            c: c[2] as f32,
            d: c[3] as f32,
            tx: c[4] as f32,
            ty: c[5] as f32,
        }
    }

    pub fn to_affine(self) -> Affine {
        Affine::new([
            self.a as f64,
            self.b as f64,
            self.c as f64,
            self.d as f64,
            self.tx as f64,
            self.ty as f64,
        ])
    }

    /// `self` applied after `other`.
    pub fn concat(self, other: GeoM) -> Self {
        Self::from_affine(self.to_affine() * other.to_affine())
    }

    pub fn det(self) -> f32 {
        self.a * self.d - self.b * self.c
    }

    pub fn apply(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.tx,
            self.b * x + self.d * y + self.ty,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_containment_and_intersection() {
        let outer = Region::new(0, 0, 16, 16);
        let inner = Region::new(4, 4, 8, 8);
        assert!(outer.contains(inner));
        assert!(!inner.contains(outer));
        assert!(outer.intersects(inner));
        assert!(!outer.intersects(Region::new(16, 0, 4, 4)));
        assert!(outer.contains_point(15, 15));
        assert!(!outer.contains_point(16, 15));
    }

    #[test]
    fn geom_concat_matches_pointwise_application() {
        let m = GeoM::translate(10.0, 5.0).concat(GeoM::scale(2.0, 3.0));
        let (x, y) = m.apply(1.0, 1.0);
        assert_eq!((x, y), (12.0, 8.0));
        assert!((m.det() - 6.0).abs() < 1e-6);
    }

    #[test]
    fn rotate_quarter_turn() {
        let m = GeoM::rotate(std::f32::consts::FRAC_PI_2);
        let (x, y) = m.apply(1.0, 0.0);
        assert!(x.abs() < 1e-6);
        assert!((y - 1.0).abs() < 1e-6);
        assert!((m.det() - 1.0).abs() < 1e-6);
    }
}
