use crate::ServiceCurve;

/// One linear piece of a [`GenServiceCurve`].
///
/// A segment starts at `x` with value `y` and rises with slope `m` until the next segment starts.
/// The last segment extends to infinity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Start of the segment, in milliseconds.
    pub x: f64,
    /// Curve value at `x`.
    pub y: f64,
    /// Slope, in bits per second.
    pub m: f64,
}

/// A generalized service curve: the sum of zero or more [`ServiceCurve`]s.
///
/// The segment list is kept canonical (strictly increasing `x`, no two adjacent segments with the
/// same slope, empty when the sum is identically zero) so that adding and then subtracting the
/// same curves yields a value equal to the one before.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenServiceCurve {
    segments: Vec<Segment>,
}

impl GenServiceCurve {
    /// Creates an empty (identically zero) curve.
    pub const fn new() -> Self {
        Self { segments: Vec::new() }
    }

    /// Returns true if no curve contributes to this sum.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The canonical segment list.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Adds `sc` to this curve.
    pub fn add(&mut self, sc: &ServiceCurve) {
        self.apply(sc, 1.0);
    }

    /// Subtracts `sc`, previously added, from this curve.
    pub fn sub(&mut self, sc: &ServiceCurve) {
        self.apply(sc, -1.0);
    }

    /// Returns true if this curve never exceeds `sc`.
    pub fn is_under(&self, sc: &ServiceCurve) -> bool {
        if sc.is_null() {
            return self.segments.iter().all(|s| s.m == 0.0);
        }

        let Some(last) = self.segments.last() else {
            return true;
        };

        if self.segments.iter().any(|s| s.y > sc.x2y(s.x)) {
            return false;
        }

        if last.m > sc.m2 as f64 {
            return false;
        }

        // The corner of `sc` falls inside the last segment, which climbs faster than `sc` does
        // before it.
        let d = sc.d as f64;
        if last.x < d && last.m > sc.m1 as f64 {
            let y = last.y + (d - last.x) * last.m;
            if y > sc.x2y(d) {
                return false;
            }
        }

        true
    }

    fn apply(&mut self, sc: &ServiceCurve, sign: f64) {
        if sc.is_null() {
            return;
        }

        let d = sc.d as f64;
        if sc.d != 0 {
            self.add_segment(0.0, Some(d), sign * sc.m1 as f64);
        }
        self.add_segment(d, None, sign * sc.m2 as f64);

        self.compress();
    }

    /// Adds a line of slope `m` starting at `x` (with value 0 there) and lasting `d`, or forever
    /// if `d` is `None`. Past its end the line contributes its final value `m * d`.
    fn add_segment(&mut self, x: f64, d: Option<f64>, m: f64) {
        let start = self.entry_at(x);
        let end = match d {
            Some(d) => self.entry_at(x + d),
            None => self.segments.len(),
        };

        for s in &mut self.segments[start..end] {
            s.m += m;
            s.y += (s.x - x) * m;
        }

        if let Some(d) = d {
            for s in &mut self.segments[end..] {
                s.y += m * d;
            }
        }
    }

    /// Returns the index of the segment starting at `x`, splitting the segment covering `x` if
    /// there is none.
    fn entry_at(&mut self, x: f64) -> usize {
        let idx = self.segments.partition_point(|s| s.x < x);
        if self.segments.get(idx).is_some_and(|s| s.x == x) {
            return idx;
        }

        let new = match idx.checked_sub(1).map(|i| self.segments[i]) {
            Some(prev) => Segment { x, y: prev.y + (x - prev.x) * prev.m, m: prev.m },
            None => Segment { x, y: 0.0, m: 0.0 },
        };
        self.segments.insert(idx, new);
        idx
    }

    /// Merges adjacent segments with equal slopes and drops the curve entirely once it is flat.
    fn compress(&mut self) {
        self.segments.dedup_by(|next, prev| next.m == prev.m);

        if let [only] = self.segments.as_slice() {
            if only.m == 0.0 && only.y == 0.0 {
                self.segments.clear();
            }
        }
    }
}
