//! Closest-approach geometry of straight lines in 3D.

use itertools::Itertools;
use nalgebra::Vector3;

use crate::Float;

/// A straight line in 3D, given by a point on the line and a direction.
///
/// The direction may have arbitrary non-zero magnitude; it is never
/// normalised.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Line<F: Float> {
    /// A point on the line.
    pub point: Vector3<F>,
    /// Direction of the line.
    pub dir: Vector3<F>,
}

impl<F: Float> Line<F> {
    /// Create a line from a point and a direction.
    pub fn new(point: Vector3<F>, dir: Vector3<F>) -> Self {
        Self { point, dir }
    }

    /// Create a line through two points.
    pub fn through(point1: Vector3<F>, point2: Vector3<F>) -> Self {
        Self {
            point: point1,
            dir: point2 - point1,
        }
    }
}

/// Result of the pairwise closest-approach computation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClosestApproach<F: Float> {
    /// The point on the first line closest to the second line.
    pub point1: Vector3<F>,
    /// The point on the second line closest to the first line.
    pub point2: Vector3<F>,
    /// Midpoint of `point1` and `point2`, the candidate vertex.
    pub vertex: Vector3<F>,
    /// Closest distance of approach, `|point1 - point2|`.
    pub cda: F,
}

/// Compute the points of closest approach of two lines and their distance.
///
/// Minimising `|P1(t1) - P2(t2)|^2` with `Pi(t) = point_i + t * dir_i` leads
/// to a 2x2 linear system solved by Cramer's rule.
///
/// # Returns
/// `None` for parallel (or coincident) lines, where the system is singular.
/// Callers must check before trusting the vertex.
///
/// # Example:
/// ```
/// # use nalgebra::Vector3;
/// # use vertexls::{closest_approach, Line};
/// let l1 = Line::new(Vector3::new(0., 0., 0.), Vector3::new(1., 0., 0.));
/// let l2 = Line::new(Vector3::new(0., 0., 5.), Vector3::new(0., 1., 0.));
/// let ca = closest_approach(&l1, &l2).unwrap();
/// assert_eq!(ca.cda, 5.);
/// ```
pub fn closest_approach<F: Float>(line1: &Line<F>, line2: &Line<F>) -> Option<ClosestApproach<F>> {
    let a = line1.dir.dot(&line1.dir);
    let b = line2.dir.dot(&line2.dir);
    let c = line1.dir.dot(&line2.dir);
    let det = c * c - a * b;
    if det == F::zero() {
        return None;
    }
    let r12 = line1.point - line2.point;
    let d = r12.dot(&line1.dir);
    let e = r12.dot(&line2.dir);
    let t1 = (b * d - c * e) / det;
    let t2 = (c * d - a * e) / det;
    let point1 = line1.point + line1.dir * t1;
    let point2 = line2.point + line2.dir * t2;
    let vertex = (point1 + point2) * F::from_f64(0.5).unwrap();
    let cda = (point1 - point2).norm();
    Some(ClosestApproach {
        point1,
        point2,
        vertex,
        cda,
    })
}

/// Estimate a common vertex of `lines` by averaging the pairwise
/// closest-approach midpoints over all line pairs.
///
/// This is a cheap, non-optimal estimate whose role is to seed the iterative
/// least-squares fit close enough to converge in few iterations. Parallel
/// pairs carry no closest-approach midpoint and are excluded from the
/// average.
///
/// # Returns
/// `None` if fewer than two lines are given, or if every pair is parallel.
pub fn seed_vertex<F: Float>(lines: &[Line<F>]) -> Option<Vector3<F>> {
    let mut sum = Vector3::zeros();
    let mut npairs = 0usize;
    for (line1, line2) in lines.iter().tuple_combinations() {
        if let Some(ca) = closest_approach(line1, line2) {
            sum += ca.vertex;
            npairs += 1;
        }
    }
    if npairs == 0 {
        return None;
    }
    Some(sum / F::from_usize(npairs).unwrap())
}
