//! Iterative linearised least-squares vertex fit.
//!
//! The measurement model expresses the 5D parameters of track `i` as a
//! function of the common vertex position `X = (x, y, z)` and the track's
//! momentum state `M_i = (dx/dz, dy/dz, P)`:
//!
//! ```text
//! h(X, M)(0) = M(0)
//! h(X, M)(1) = M(1)
//! h(X, M)(2) = X(0) + (z_ref - X(2)) * M(0)
//! h(X, M)(3) = X(1) + (z_ref - X(2)) * M(1)
//! h(X, M)(4) = M(2)
//! ```
//!
//! The model is linearised around the current estimate,
//! `h(X, M) = h(X0, M0) + A (X - X0) + B (M - M0)`, and the chi2
//! `sum_i r_i^T W_i r_i` with `r_i = x_i - h(X, M_i)` is minimised by
//! eliminating the per-track momentum block (Schur complement) and solving a
//! single 3x3 system for the vertex update. After each iteration the
//! predictions and derivative matrices are recomputed at the new estimate.

use log::debug;
use nalgebra::{Matrix3, Matrix5, Matrix5x3, Vector3, Vector5};

use crate::geometry::{seed_vertex, Line};
use crate::track::TrackState;
use crate::Float;

/// Default number of fit iterations.
pub const DEFAULT_ITERATIONS: usize = 3;

/// Default z position of the track parametrisation reference plane, in mm.
pub const DEFAULT_Z_REF: f64 = 180000.;

/// Total-momentum constraint for the optional refit after the unconstrained
/// fit, see [`VertexFit::apply_momentum_constraint()`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MomentumConstraint<F: Float> {
    /// Total three-momentum the outgoing tracks must sum to, e.g. the
    /// measured parent momentum.
    pub target: Vector3<F>,
    /// Per-axis uncertainty of `target`.
    pub sigma: Vector3<F>,
}

impl<F: Float> Default for MomentumConstraint<F> {
    /// Nominal beam momentum of 75 GeV/c along z, with the design resolution
    /// (0.2% on P, 16 urad on the slopes).
    fn default() -> Self {
        Self {
            target: Vector3::new(
                F::zero(),
                F::zero(),
                F::from_f64(75000.).unwrap(),
            ),
            sigma: Vector3::new(
                F::from_f64(1.2).unwrap(),
                F::from_f64(1.2).unwrap(),
                F::from_f64(150.).unwrap(),
            ),
        }
    }
}

/// Per-track state and iteration scratch of the fit.
///
/// All matrices are recomputed from scratch at every linearisation.
#[derive(Clone, Debug)]
struct FitTrack<F: Float> {
    /// Measured parameters `(dx/dz, dy/dz, x, y, P)` at the reference plane.
    params: Vector5<F>,
    /// Weight matrix, the inverse of the measured covariance.
    weight: Matrix5<F>,
    /// Current momentum state `(dx/dz, dy/dz, P)`.
    momentum: Vector3<F>,
    /// Parameters predicted from the current vertex and momentum state.
    predicted: Vector5<F>,
    /// Residual, measured minus predicted.
    residual: Vector5<F>,
    /// Derivative of the model with respect to the vertex position.
    a: Matrix5x3<F>,
    /// A^T W A
    f: Matrix3<F>,
    /// A^T W B
    d: Matrix3<F>,
    /// (B^T W B)^-1
    e_inv: Matrix3<F>,
    /// Derivative of the Cartesian momentum with respect to the momentum
    /// state, used by the momentum constraint.
    k: Matrix3<F>,
}

impl<F: Float> FitTrack<F> {
    fn new(state: &TrackState<F>) -> Option<Self> {
        let weight = state.cov.try_inverse()?;
        Some(Self {
            params: state.params,
            weight,
            momentum: Vector3::new(state.params[0], state.params[1], state.params[4]),
            predicted: Vector5::zeros(),
            residual: Vector5::zeros(),
            a: Matrix5x3::zeros(),
            f: Matrix3::zeros(),
            d: Matrix3::zeros(),
            e_inv: Matrix3::zeros(),
            k: Matrix3::zeros(),
        })
    }
}

/// Least-squares fit of a common vertex to a set of tracks.
///
/// Usage follows a strict sequence: [`reset()`](VertexFit::reset()), then
/// [`add_track()`](VertexFit::add_track()) for every track of the candidate,
/// then [`fit()`](VertexFit::fit()), after which the vertex position,
/// per-track momenta, chi2 and covariances are queryable. Adding tracks
/// after fitting without a reset is a caller error and yields meaningless
/// results. One instance may be reused for many candidates in sequence, and
/// concurrent use requires one instance per worker.
#[derive(Clone, Debug)]
pub struct VertexFit<F: Float> {
    z_ref: F,
    vertex: Vector3<F>,
    chi2: F,
    tracks: Vec<FitTrack<F>>,
    /// Derivative of the model with respect to the momentum state. Shared by
    /// all tracks: it depends only on the vertex z.
    b: Matrix5x3<F>,
    /// Sum of the per-track F matrices.
    d0: Matrix3<F>,
    /// Covariance of the fitted vertex position, `(D0 - sum D E^-1 D^T)^-1`.
    c0: Matrix3<F>,
    /// Propagated covariance of the momentum-constraint residual.
    constraint_cov: Option<Matrix3<F>>,
}

impl<F: Float> Default for VertexFit<F> {
    fn default() -> Self {
        Self::new(F::from_f64(DEFAULT_Z_REF).unwrap())
    }
}

impl<F: Float> VertexFit<F> {
    /// Create an empty fit with the given reference plane z position.
    pub fn new(z_ref: F) -> Self {
        Self {
            z_ref,
            vertex: Vector3::zeros(),
            chi2: F::zero(),
            tracks: Vec::new(),
            b: Matrix5x3::zeros(),
            d0: Matrix3::zeros(),
            c0: Matrix3::zeros(),
            constraint_cov: None,
        }
    }

    /// Drop all tracks and scratch state so the instance can be reused for
    /// the next candidate.
    pub fn reset(&mut self) {
        self.vertex = Vector3::zeros();
        self.chi2 = F::zero();
        self.tracks.clear();
        self.b = Matrix5x3::zeros();
        self.d0 = Matrix3::zeros();
        self.c0 = Matrix3::zeros();
        self.constraint_cov = None;
    }

    /// Add a track candidate to the fit.
    ///
    /// # Errors
    /// Fails if the track covariance is singular, leaving the fit unchanged;
    /// the caller decides whether to drop the track or the whole candidate.
    pub fn add_track(&mut self, state: &TrackState<F>) -> Result<(), &'static str> {
        let track = FitTrack::new(state).ok_or("track covariance is singular")?;
        self.tracks.push(track);
        Ok(())
    }

    /// Number of tracks currently in the fit.
    pub fn n_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Fitted vertex position.
    pub fn vertex(&self) -> Vector3<F> {
        self.vertex
    }

    /// Chi2 of the last iteration.
    pub fn chi2(&self) -> F {
        self.chi2
    }

    /// Reference plane z position.
    pub fn z_ref(&self) -> F {
        self.z_ref
    }

    /// Set the reference plane z position. Only meaningful before tracks are
    /// added.
    pub fn set_z_ref(&mut self, z_ref: F) {
        self.z_ref = z_ref;
    }

    /// Fitted slopes and momentum `(dx/dz, dy/dz, P)` of track `i`.
    ///
    /// # Panics
    /// Panics if `i` is not smaller than [`n_tracks()`](VertexFit::n_tracks()).
    pub fn track_slopes_momentum(&self, i: usize) -> Vector3<F> {
        self.tracks[i].momentum
    }

    /// Fitted Cartesian three-momentum `(px, py, pz)` of track `i`.
    ///
    /// # Panics
    /// Panics if `i` is not smaller than [`n_tracks()`](VertexFit::n_tracks()).
    pub fn track_three_momentum(&self, i: usize) -> Vector3<F> {
        let m = self.tracks[i].momentum;
        let n = (F::one() + m.x * m.x + m.y * m.y).sqrt();
        Vector3::new(m.x * m.z / n, m.y * m.z / n, m.z / n)
    }

    /// Run the full fit for straight tracks: seed the vertex from the
    /// multi-line closest approach, then iterate the linearised solve a fixed
    /// number of times ([`DEFAULT_ITERATIONS`] unless configured otherwise).
    ///
    /// No convergence test is applied; the iteration count alone bounds the
    /// loop. The chi2 change per iteration is logged at debug level.
    ///
    /// # Errors
    /// Refuses to run with fewer than two tracks, and fails if the seed or
    /// the normal equations are degenerate. No partial result is produced on
    /// failure.
    pub fn fit(&mut self, iterations: usize) -> Result<(), &'static str> {
        if self.tracks.len() < 2 {
            return Err("vertex fit requires at least two tracks");
        }

        let lines: Vec<Line<F>> = self
            .tracks
            .iter()
            .map(|trk| {
                Line::new(
                    Vector3::new(trk.params[2], trk.params[3], self.z_ref),
                    Vector3::new(-trk.params[0], -trk.params[1], -F::one()),
                )
            })
            .collect();
        self.vertex = seed_vertex(&lines).ok_or("degenerate seed geometry")?;

        self.linearise()?;
        self.update_predictions();
        self.update_chi2();
        for iteration in 1..iterations {
            self.solve()?;
            self.linearise()?;
            self.update_predictions();
            let dchi2 = self.update_chi2();
            debug!(
                "iteration {iteration}: chi2 = {:?}, dchi2 = {:?}",
                self.chi2, dchi2
            );
        }
        Ok(())
    }

    /// Recompute the derivative matrices A and B and the per-track block
    /// reduction at the current estimate.
    fn linearise(&mut self) -> Result<(), &'static str> {
        let dz = self.z_ref - self.vertex.z;
        self.b = Matrix5x3::zeros();
        self.b[(0, 0)] = F::one();
        self.b[(1, 1)] = F::one();
        self.b[(2, 0)] = dz;
        self.b[(3, 1)] = dz;
        self.b[(4, 2)] = F::one();

        self.d0 = Matrix3::zeros();
        for trk in &mut self.tracks {
            trk.a = Matrix5x3::zeros();
            trk.a[(2, 0)] = F::one();
            trk.a[(2, 2)] = -trk.momentum.x;
            trk.a[(3, 1)] = F::one();
            trk.a[(3, 2)] = -trk.momentum.y;

            let atw = trk.a.transpose() * trk.weight;
            let btw = self.b.transpose() * trk.weight;
            trk.f = atw * trk.a;
            trk.d = atw * self.b;
            let e = btw * self.b;
            trk.e_inv = e.try_inverse().ok_or("degenerate momentum block")?;
            self.d0 += trk.f;
        }
        Ok(())
    }

    /// Recompute the predicted parameters and residuals of every track from
    /// the current vertex and momentum states.
    fn update_predictions(&mut self) {
        let dz = self.z_ref - self.vertex.z;
        for trk in &mut self.tracks {
            let m = trk.momentum;
            trk.predicted = Vector5::new(
                m.x,
                m.y,
                self.vertex.x + dz * m.x,
                self.vertex.y + dz * m.y,
                m.z,
            );
            trk.residual = trk.params - trk.predicted;
        }
    }

    /// One linearised solve: eliminate the momentum blocks, update the vertex
    /// position, then back-substitute the per-track momentum updates.
    fn solve(&mut self) -> Result<(), &'static str> {
        let identity = Matrix5::identity();
        let mut sum_z = Vector3::zeros();
        for trk in &self.tracks {
            let gain = identity - self.b * trk.e_inv * self.b.transpose() * trk.weight;
            sum_z += trk.a.transpose() * trk.weight * gain * trk.residual;
        }
        self.update_vertex_cov()?;
        let dxyz = self.c0 * sum_z;

        for trk in &mut self.tracks {
            let reduced = trk.residual - trk.a * dxyz;
            let dm = trk.e_inv * self.b.transpose() * trk.weight * reduced;
            trk.momentum += dm;
        }
        self.vertex += dxyz;
        Ok(())
    }

    /// Recompute the chi2 from the current residuals and return the change
    /// with respect to the previous value.
    fn update_chi2(&mut self) -> F {
        let mut chi2 = F::zero();
        for trk in &self.tracks {
            chi2 += trk.residual.dot(&(trk.weight * trk.residual));
        }
        let dchi2 = self.chi2 - chi2;
        self.chi2 = chi2;
        dchi2
    }

    /// Recompute the covariance of the vertex position,
    /// `C0 = (D0 - sum_i D_i E_i^-1 D_i^T)^-1`.
    fn update_vertex_cov(&mut self) -> Result<(), &'static str> {
        let mut sum = Matrix3::zeros();
        for trk in &self.tracks {
            sum += trk.d * trk.e_inv * trk.d.transpose();
        }
        self.c0 = (self.d0 - sum)
            .try_inverse()
            .ok_or("degenerate vertex information matrix")?;
        Ok(())
    }

    /// Covariance of the vertex position and the momentum state of track `i`.
    ///
    /// # Panics
    /// Panics if `i` is not smaller than [`n_tracks()`](VertexFit::n_tracks()).
    pub fn cov_vertex_track(&self, i: usize) -> Matrix3<F> {
        let trk = &self.tracks[i];
        -(self.c0 * trk.d * trk.e_inv)
    }

    /// Covariance of the momentum states of tracks `i` and `j`.
    ///
    /// # Panics
    /// Panics if `i` or `j` is not smaller than
    /// [`n_tracks()`](VertexFit::n_tracks()).
    pub fn cov_tracks(&self, i: usize, j: usize) -> Matrix3<F> {
        let trk_i = &self.tracks[i];
        let trk_j = &self.tracks[j];
        let c0j = self.c0 * trk_j.d * trk_j.e_inv;
        let mut cij = trk_i.e_inv * trk_i.d.transpose() * c0j;
        if i == j {
            cij += trk_j.e_inv;
        }
        cij
    }

    /// Propagated covariance of the total-momentum residual from the last
    /// [`apply_momentum_constraint()`](VertexFit::apply_momentum_constraint())
    /// call, including the target uncertainties on the diagonal.
    pub fn constraint_cov(&self) -> Option<Matrix3<F>> {
        self.constraint_cov
    }

    /// Constrain the total three-momentum of the fitted tracks to an
    /// externally known parent momentum.
    ///
    /// A single linear correction is applied on top of the converged
    /// unconstrained fit: the momentum-sum residual `r` is propagated through
    /// the per-track Jacobians `K_i = d(px,py,pz)/dM_i` and the pairwise fit
    /// covariances, and vertex and momentum states are shifted by the
    /// corresponding gain. The correction is not iterated.
    ///
    /// # Errors
    /// Fails if called before a successful [`fit()`](VertexFit::fit()) or if
    /// the propagated constraint covariance is singular.
    pub fn apply_momentum_constraint(
        &mut self,
        constraint: &MomentumConstraint<F>,
    ) -> Result<(), &'static str> {
        if self.tracks.len() < 2 {
            return Err("vertex fit requires at least two tracks");
        }
        self.update_vertex_cov()?;

        let mut r = -constraint.target;
        for trk in &mut self.tracks {
            let m = trk.momentum;
            let n = (F::one() + m.x * m.x + m.y * m.y).sqrt();
            let n3 = n * n * n;
            trk.k = Matrix3::new(
                (F::one() + m.y * m.y) * m.z / n3,
                -m.x * m.y * m.z / n3,
                m.x / n,
                -m.x * m.y * m.z / n3,
                (F::one() + m.x * m.x) * m.z / n3,
                m.y / n,
                -m.z * m.x / n3,
                -m.z * m.y / n3,
                F::one() / n,
            );
            r += Vector3::new(m.x * m.z / n, m.y * m.z / n, m.z / n);
        }

        let mut cov = Matrix3::zeros();
        for i in 0..self.tracks.len() {
            for j in 0..self.tracks.len() {
                cov += self.tracks[i].k * self.cov_tracks(i, j) * self.tracks[j].k.transpose();
            }
        }
        cov[(0, 0)] += constraint.sigma.x * constraint.sigma.x;
        cov[(1, 1)] += constraint.sigma.y * constraint.sigma.y;
        cov[(2, 2)] += constraint.sigma.z * constraint.sigma.z;
        self.constraint_cov = Some(cov);

        let gain = cov
            .try_inverse()
            .ok_or("singular constraint covariance")?;

        let mut dxyz = Vector3::zeros();
        let mut dms = vec![Vector3::zeros(); self.tracks.len()];
        for i in 0..self.tracks.len() {
            let k_i = self.tracks[i].k;
            dxyz += self.cov_vertex_track(i) * k_i.transpose() * gain * r;
            for j in 0..self.tracks.len() {
                let k_j = self.tracks[j].k;
                dms[i] += self.cov_tracks(i, j) * k_j.transpose() * gain * r;
            }
        }
        for (trk, dm) in self.tracks.iter_mut().zip(dms) {
            trk.momentum -= dm;
        }
        self.vertex -= dxyz;
        Ok(())
    }
}
