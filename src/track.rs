//! Spectrometer track input records and their reference-plane state.

use nalgebra::{Matrix5, Vector3, Vector5};

use crate::Float;

/// A reconstructed spectrometer track as delivered by the upstream Kalman
/// fit, expressed at the reference plane before the magnet.
///
/// The covariance matrix is in the spectrometer's native parametrisation,
/// where the fifth coordinate is the *inverse* momentum `1/P`. It is
/// transformed to the `(dx/dz, dy/dz, x, y, P)` parametrisation used by the
/// vertex fit in [`state()`](SpectrometerTrack::state()).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpectrometerTrack<F: Float> {
    /// Track slope dx/dz before the magnet.
    pub slope_x: F,
    /// Track slope dy/dz before the magnet.
    pub slope_y: F,
    /// Track x position at the reference plane.
    pub x: F,
    /// Track y position at the reference plane.
    pub y: F,
    /// Momentum magnitude.
    pub momentum: F,
    /// Signed electrical charge.
    pub charge: i32,
    /// Covariance matrix of `(dx/dz, dy/dz, x, y, 1/P)`.
    pub cov: Matrix5<F>,
}

impl<F: Float> SpectrometerTrack<F> {
    /// The 5D track state handed to the vertex fit.
    ///
    /// The covariance is transformed with the change-of-variables Jacobian
    /// `C = diag(1, 1, 1, 1, -P^2)` of the map `1/P -> P`, as
    /// `cov' = C^T cov C`.
    pub fn state(&self) -> TrackState<F> {
        let params = Vector5::new(self.slope_x, self.slope_y, self.x, self.y, self.momentum);
        let mut jac = Matrix5::identity();
        jac[(4, 4)] = -self.momentum * self.momentum;
        let cov = jac.transpose() * self.cov * jac;
        TrackState { params, cov }
    }

    /// Cartesian three-momentum from the raw (pre-fit) track parameters.
    pub fn three_momentum(&self) -> Vector3<F> {
        let n = (F::one() + self.slope_x * self.slope_x + self.slope_y * self.slope_y).sqrt();
        Vector3::new(
            self.slope_x * self.momentum / n,
            self.slope_y * self.momentum / n,
            self.momentum / n,
        )
    }
}

/// Track parameters `(dx/dz, dy/dz, x, y, P)` at the reference plane, with
/// their covariance, ready to be added to a [`VertexFit`](crate::VertexFit).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackState<F: Float> {
    /// Parameter vector `(dx/dz, dy/dz, x, y, P)`.
    pub params: Vector5<F>,
    /// Covariance matrix of `params`.
    pub cov: Matrix5<F>,
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix5, Vector3};

    use super::*;

    fn track(momentum: f64) -> SpectrometerTrack<f64> {
        let mut cov = Matrix5::identity();
        cov[(0, 4)] = 2e-6;
        cov[(4, 0)] = 2e-6;
        cov[(4, 4)] = 1e-10;
        SpectrometerTrack {
            slope_x: 3e-3,
            slope_y: -1e-3,
            x: 25.,
            y: -10.,
            momentum,
            charge: 1,
            cov,
        }
    }

    #[test]
    fn covariance_change_of_variables() {
        let p = 10000.;
        let track = track(p);
        let state = track.state();

        // Slope/position block untouched, momentum row and column scaled by
        // -P^2, momentum variance by P^4.
        assert_abs_diff_eq!(state.cov[(0, 0)], 1., epsilon = 1e-15);
        assert_abs_diff_eq!(state.cov[(2, 2)], 1., epsilon = 1e-15);
        assert_abs_diff_eq!(state.cov[(0, 4)], 2e-6 * -p * p, epsilon = 1e-6);
        assert_abs_diff_eq!(state.cov[(4, 0)], 2e-6 * -p * p, epsilon = 1e-6);
        assert_abs_diff_eq!(state.cov[(4, 4)], 1e-10 * p * p * p * p, epsilon = 1e-6);

        assert_eq!(
            state.params.as_slice(),
            &[3e-3, -1e-3, 25., -10., 10000.][..]
        );
    }

    #[test]
    fn three_momentum_norm() {
        let track = track(10000.);
        let p = track.three_momentum();

        assert_abs_diff_eq!(p.norm(), 10000., epsilon = 1e-9);
        // Direction along the slopes.
        let dir = Vector3::new(3e-3, -1e-3, 1.).normalize();
        assert_abs_diff_eq!(p.normalize(), dir, epsilon = 1e-12);
    }
}
