#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Service curve arithmetic.
//!
//! A [`ServiceCurve`] is the two-piece linear curve a hierarchical fair service curve class is
//! configured with: slope `m1` until the corner at `d` milliseconds, then slope `m2`.
//!
//! A [`GenServiceCurve`] is an arbitrary piecewise-linear curve obtained by summing any number of
//! service curves. Parents keep one per curve type to track what their children have been
//! promised, and admission control asks whether that sum still fits under the parent's own curve:
//!
//! ```
//! use qctl_curve::{GenServiceCurve, ServiceCurve};
//!
//! let parent = ServiceCurve::linear(10_000_000);
//! let mut children = GenServiceCurve::new();
//!
//! children.add(&ServiceCurve::new(8_000_000, 10, 2_000_000));
//! children.add(&ServiceCurve::linear(2_000_000));
//! assert!(children.is_under(&parent));
//!
//! children.add(&ServiceCurve::linear(3_000_000));
//! assert!(!children.is_under(&parent));
//! ```

mod gsc;
pub use gsc::{GenServiceCurve, Segment};

/// A two-piece linear service curve.
///
/// `m1` and `m2` are rates in bits per second, `d` is the corner in milliseconds. A curve with
/// `m1 > m2` is concave (burst first), one with `m1 == 0 && m2 > 0` is convex (delayed start).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ServiceCurve {
    /// Slope of the first segment.
    pub m1: u64,
    /// Length of the first segment, in milliseconds.
    pub d: u64,
    /// Slope of the second segment.
    pub m2: u64,
}

impl ServiceCurve {
    /// The null curve. Classes without a real-time or link-sharing commitment carry this.
    pub const NULL: Self = Self { m1: 0, d: 0, m2: 0 };

    /// Creates a new two-piece curve.
    pub const fn new(m1: u64, d: u64, m2: u64) -> Self {
        Self { m1, d, m2 }
    }

    /// A curve with a single slope.
    pub const fn linear(rate: u64) -> Self {
        Self { m1: rate, d: 0, m2: rate }
    }

    /// Returns true if this curve promises nothing.
    pub const fn is_null(&self) -> bool {
        self.m1 == 0 && self.m2 == 0
    }

    /// A convex curve must start flat: a non-zero first slope below the second one has no
    /// scheduling meaning.
    pub const fn is_valid(&self) -> bool {
        !(self.m1 < self.m2 && self.m1 != 0)
    }

    /// Cumulative service at `x` milliseconds.
    pub fn x2y(&self, x: f64) -> f64 {
        let d = self.d as f64;
        if x <= d {
            x * self.m1 as f64
        } else {
            d * self.m1 as f64 + (x - d) * self.m2 as f64
        }
    }
}

impl std::fmt::Display for ServiceCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.d == 0 {
            write!(f, "{}bps", self.m2)
        } else {
            write!(f, "({}bps {}ms {}bps)", self.m1, self.d, self.m2)
        }
    }
}
