//! Periodic-box geometry: nearest-image displacements and unwrapping.

/// Per-axis periodicity of a box.
///
/// Axes with `periodic[a] == false` use plain Euclidean displacement; the
/// `period` entry is ignored for them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Periodicity {
    /// Box length along each axis
    pub period: [f64; 3],
    /// Whether each axis wraps
    pub periodic: [bool; 3],
}

impl Periodicity {
    /// Fully periodic box with the given side lengths.
    pub fn periodic(period: [f64; 3]) -> Self {
        Self {
            period,
            periodic: [true; 3],
        }
    }

    /// No wrapping on any axis.
    pub fn open() -> Self {
        Self {
            period: [0.0; 3],
            periodic: [false; 3],
        }
    }

    /// Nearest-image displacement `a - b`.
    #[inline]
    pub fn displacement(&self, a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        let mut d = [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
        for axis in 0..3 {
            if self.periodic[axis] {
                d[axis] = min_image(d[axis], self.period[axis]);
            }
        }
        d
    }

    /// Squared nearest-image distance.
    #[inline]
    pub fn distance_sq(&self, a: [f64; 3], b: [f64; 3]) -> f64 {
        let d = self.displacement(a, b);
        d[0] * d[0] + d[1] * d[1] + d[2] * d[2]
    }

    /// Move `x` onto the image closest to `reference` along every periodic axis.
    ///
    /// The result lies in `[reference - period/2, reference + period/2)`.
    #[inline]
    pub fn unwrap_near(&self, x: [f64; 3], reference: [f64; 3]) -> [f64; 3] {
        let mut out = x;
        for axis in 0..3 {
            if self.periodic[axis] {
                let p = self.period[axis];
                let low = reference[axis] - 0.5 * p;
                out[axis] = low + (x[axis] - low).rem_euclid(p);
            }
        }
        out
    }

    /// Wrap `x` into `[origin, origin + period)` along every periodic axis.
    #[inline]
    pub fn wrap(&self, x: [f64; 3], origin: [f64; 3]) -> [f64; 3] {
        let mut out = x;
        for axis in 0..3 {
            if self.periodic[axis] {
                out[axis] = wrap_coordinate(x[axis], origin[axis], self.period[axis]);
            }
        }
        out
    }
}

/// Nearest-image reduction of a one-dimensional displacement.
#[inline]
pub fn min_image(d: f64, period: f64) -> f64 {
    if period > 0.0 {
        d - period * (d / period).round()
    } else {
        d
    }
}

/// Wrap a coordinate into `[origin, origin + period)`.
#[inline]
pub fn wrap_coordinate(x: f64, origin: f64, period: f64) -> f64 {
    let w = origin + (x - origin).rem_euclid(period);
    // rem_euclid can round up to exactly `period` for tiny negative offsets
    if w >= origin + period {
        origin
    } else {
        w
    }
}
