//! Approximate equality of floating point results.
//!
//! CPU and accelerator implementations of a unit reduce in different orders,
//! so their outputs are compared within a tolerance instead of bit for bit.

/// Tolerance for results that went through `f32` accelerator kernels.
pub const F32_TOLERANCE: f64 = 1e-3;

/// Tolerance for results computed twice in `f64` on the CPU.
pub const F64_TOLERANCE: f64 = 1e-9;

/// How close two values (or two sequences of values) are.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Bit-identical or within `f64` rounding.
    Precise = 0,
    /// Within the accelerator tolerance.
    Relative = 1,
    /// Not equal.
    Scarce = 2,
}

/// Relative distance `|a - b| / max(1, |a|, |b|)`.
#[inline]
pub fn relative_diff(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().max(b.abs()).max(1.0)
}

/// Rates the relative distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

fn rate(diff: f64) -> ApproxEquality {
    if diff <= F64_TOLERANCE {
        ApproxEquality::Precise
    } else if diff <= F32_TOLERANCE {
        ApproxEquality::Relative
    } else {
        ApproxEquality::Scarce
    }
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        rate(relative_diff(f64::from(*self), f64::from(*rhs)))
    }
}

impl RelativeEq<Self> for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        rate(relative_diff(*self, *rhs))
    }
}

impl RelativeEq<f64> for f32 {
    fn approx_eq(&self, rhs: &f64) -> ApproxEquality {
        rate(relative_diff(f64::from(*self), *rhs))
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    /// The worst rating over all pairs; slices of different length are `Scarce`.
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            eq = eq.max(a.approx_eq(b));
            if eq == ApproxEquality::Scarce {
                break;
            }
        }
        eq
    }
}

/// True when `a` and `b` agree within the accelerator tolerance.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) != ApproxEquality::Scarce
}

/// Summary of how far an accelerator result is from a reference.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Divergence {
    /// `||result - reference||_2 / n`.
    pub mean_diff: f64,
    /// `max |result - reference|`.
    pub max_diff: f64,
    /// `max_diff / max(1, max |reference|)`.
    pub relative: f64,
}

/// Compares `result` element-wise against `reference`.
///
/// Returns `None` if the lengths differ.
pub fn divergence(result: &[f64], reference: &[f64]) -> Option<Divergence> {
    if result.len() != reference.len() {
        return None;
    }
    if result.is_empty() {
        return Some(Divergence::default());
    }

    let mut sq_sum = 0.0;
    let mut max_diff = 0.0f64;
    let mut magnitude = 1.0f64;
    for (&r, &e) in result.iter().zip(reference) {
        let d = (r - e).abs();
        sq_sum += d * d;
        max_diff = max_diff.max(d);
        magnitude = magnitude.max(e.abs());
    }

    Some(Divergence {
        mean_diff: sq_sum.sqrt() / result.len() as f64,
        max_diff,
        relative: max_diff / magnitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratings_follow_distance() {
        assert_eq!(1.0f64.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0f32.approx_eq(&1.0005f32), ApproxEquality::Relative);
        assert_eq!(1.0f32.approx_eq(&1.1f32), ApproxEquality::Scarce);
    }

    #[test]
    fn slices_take_worst_rating() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [1.0f32, 2.0005, 3.0];
        assert_eq!(a[..].approx_eq(&b[..]), ApproxEquality::Relative);
        assert!(approx_eq(&a[..], &b[..]));
        assert!(!approx_eq(&a[..], &[1.0f32, 2.0][..]));
    }

    #[test]
    fn divergence_reports_max_and_relative() {
        let d = divergence(&[1.0, 10.5], &[1.0, 10.0]).unwrap();
        assert_eq!(d.max_diff, 0.5);
        assert!((d.relative - 0.05).abs() < 1e-12);
        assert!(divergence(&[1.0], &[]).is_none());
    }
}
