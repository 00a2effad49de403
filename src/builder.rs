//! Combinatorial vertex-candidate search.

use itertools::Itertools;
use log::{debug, info};
use nalgebra::Vector3;

use crate::fitter::{VertexFit, DEFAULT_ITERATIONS, DEFAULT_Z_REF};
use crate::track::SpectrometerTrack;
use crate::vertex::{Vertex, VertexTrack};
use crate::Float;

/// Smallest supported vertex group size.
const MIN_GROUP_SIZE: usize = 2;
/// Largest supported vertex group size.
const MAX_GROUP_SIZE: usize = 5;

/// Builds all vertex candidates of the enabled group sizes from an event's
/// track collection and keeps those with a good chi2.
///
/// For every enabled size `k`, all strictly increasing `k`-tuples of track
/// indices are enumerated in lexicographic order and fitted independently; a
/// track may appear in vertices of several sizes and in several vertices of
/// the same size. For more details, check the module-level documentation of
/// the crate.
#[derive(Clone, Debug)]
pub struct VertexBuilder<'a, F: Float> {
    /// The event's track collection.
    tracks: &'a [SpectrometerTrack<F>],
    /// Which group sizes to attempt, indexed by `size - 2`.
    sizes: [bool; MAX_GROUP_SIZE - MIN_GROUP_SIZE + 1],
    /// Chi2 acceptance threshold.
    max_chi2: F,
    /// Events with more tracks are skipped entirely.
    max_tracks: usize,
    /// Cap on the accepted vertex collection.
    max_vertices: usize,
    /// Reference plane z position.
    z_ref: F,
    /// Fixed fit iteration count.
    iterations: usize,
}

impl<'a, F: Float> VertexBuilder<'a, F> {
    /// Create a search over `tracks` with default parameters: three-track
    /// vertices only, chi2 threshold 100, at most 50 input tracks, at most
    /// 50 accepted vertices, reference plane at 180 m.
    pub fn new(tracks: &'a [SpectrometerTrack<F>]) -> Self {
        Self {
            tracks,
            sizes: [false, true, false, false],
            max_chi2: F::from_f64(100.).unwrap(),
            max_tracks: 50,
            max_vertices: 50,
            z_ref: F::from_f64(DEFAULT_Z_REF).unwrap(),
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// Enable vertex candidates of `size` tracks (2 to 5). Can be chained to
    /// enable several sizes; the default is three-track vertices only.
    ///
    /// # Panics
    /// Panics if `size` is outside 2..=5.
    pub fn with_group_size(mut self, size: usize) -> Self {
        assert!(
            (MIN_GROUP_SIZE..=MAX_GROUP_SIZE).contains(&size),
            "vertex group size must be between 2 and 5"
        );
        self.sizes[size - MIN_GROUP_SIZE] = true;
        self
    }

    /// Disable all group sizes. Useful before re-enabling a custom set with
    /// [`with_group_size`](VertexBuilder::with_group_size()).
    pub fn with_no_group_sizes(mut self) -> Self {
        self.sizes = [false; MAX_GROUP_SIZE - MIN_GROUP_SIZE + 1];
        self
    }

    /// Set the chi2 acceptance threshold.
    pub fn with_max_chi2(mut self, max_chi2: F) -> Self {
        self.max_chi2 = max_chi2;
        self
    }

    /// Set the number of input tracks above which the search is abandoned.
    pub fn with_max_tracks(mut self, max_tracks: usize) -> Self {
        self.max_tracks = max_tracks;
        self
    }

    /// Set the cap on the accepted vertex collection.
    pub fn with_max_vertices(mut self, max_vertices: usize) -> Self {
        self.max_vertices = max_vertices;
        self
    }

    /// Set the reference plane z position.
    pub fn with_z_ref(mut self, z_ref: F) -> Self {
        self.z_ref = z_ref;
        self
    }

    /// Set the fixed fit iteration count.
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Enumerate, fit and filter all candidates, returning the accepted
    /// vertices in enumeration order.
    ///
    /// Returns an empty collection without attempting any fit when fewer
    /// than two tracks are given or the input exceeds the track cap. Once
    /// the vertex cap is reached the remaining combinations are skipped.
    pub fn build(&self) -> Vec<Vertex<F>> {
        let n = self.tracks.len();
        let mut vertices = Vec::new();
        if n < MIN_GROUP_SIZE {
            return vertices;
        }
        if n > self.max_tracks {
            info!("giving up vertex search: {n} tracks exceed the cap of {}", self.max_tracks);
            return vertices;
        }

        let mut fitter = VertexFit::new(self.z_ref);
        for size in self.enabled_sizes() {
            for indices in (0..n).combinations(size) {
                if let Some(vertex) = self.fit_combination(&mut fitter, &indices) {
                    if vertices.len() >= self.max_vertices {
                        info!("vertex cap of {} reached, dropping further candidates", self.max_vertices);
                        return vertices;
                    }
                    vertices.push(vertex);
                }
            }
        }
        debug!("accepted {} vertices from {n} tracks", vertices.len());
        vertices
    }

    /// The enabled group sizes not exceeding the track count.
    fn enabled_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        let n = self.tracks.len();
        self.sizes
            .iter()
            .enumerate()
            .filter(move |(k, enabled)| **enabled && k + MIN_GROUP_SIZE <= n)
            .map(|(k, _)| k + MIN_GROUP_SIZE)
    }

    /// Fit one track combination and materialise a [`Vertex`] if its chi2
    /// passes the threshold.
    ///
    /// Combinations containing a track with a singular covariance are
    /// skipped, as are those where the fit refuses to run.
    fn fit_combination(&self, fitter: &mut VertexFit<F>, indices: &[usize]) -> Option<Vertex<F>> {
        fitter.reset();
        let mut charge = 0;
        for &index in indices {
            let track = &self.tracks[index];
            charge += track.charge;
            if fitter.add_track(&track.state()).is_err() {
                debug!("skipping combination {indices:?}: singular track covariance");
                return None;
            }
        }
        if let Err(reason) = fitter.fit(self.iterations) {
            debug!("skipping combination {indices:?}: {reason}");
            return None;
        }
        if fitter.chi2() > self.max_chi2 {
            return None;
        }

        let mut total_momentum = Vector3::zeros();
        let mut members = Vec::with_capacity(indices.len());
        for (slot, &index) in indices.iter().enumerate() {
            let momentum = fitter.track_three_momentum(slot);
            total_momentum += momentum;
            members.push(VertexTrack {
                index,
                momentum,
                momentum_prefit: self.tracks[index].three_momentum(),
            });
        }
        Some(Vertex {
            charge,
            position: fitter.vertex(),
            chi2: fitter.chi2(),
            total_momentum,
            tracks: members,
        })
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;
    use rayon::prelude::*;

    impl<F> VertexBuilder<'_, F>
    where
        F: Float + Send + Sync,
    {
        /// Enumerate, fit and filter all candidates in parallel, one fit
        /// engine per worker.
        ///
        /// Also see [`build`](VertexBuilder::build()) for more details.
        /// Results are returned in enumeration order and truncated to the
        /// vertex cap, so serial and parallel searches agree.
        pub fn build_par(&self) -> Vec<Vertex<F>> {
            let n = self.tracks.len();
            if n < MIN_GROUP_SIZE {
                return Vec::new();
            }
            if n > self.max_tracks {
                info!("giving up vertex search: {n} tracks exceed the cap of {}", self.max_tracks);
                return Vec::new();
            }

            let combinations: Vec<Vec<usize>> = self
                .enabled_sizes()
                .flat_map(|size| (0..n).combinations(size))
                .collect();
            info!("fitting {} candidate combinations", combinations.len());

            let mut vertices: Vec<Vertex<F>> = combinations
                .par_iter()
                .map_init(
                    || VertexFit::new(self.z_ref),
                    |fitter, indices| self.fit_combination(fitter, indices),
                )
                .flatten()
                .collect();
            vertices.truncate(self.max_vertices);
            vertices
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix5, Vector3, Vector5};

    use super::*;
    use crate::fitter::DEFAULT_Z_REF;

    /// A track passing exactly through `vertex`, expressed at the default
    /// reference plane. The native covariance is for `1/P`, so the momentum
    /// variance is `sigma_P^2 / P^4` with `sigma_P = 100`.
    fn track_through(
        vertex: Vector3<f64>,
        slope_x: f64,
        slope_y: f64,
        momentum: f64,
        charge: i32,
    ) -> SpectrometerTrack<f64> {
        let dz = DEFAULT_Z_REF - vertex.z;
        let inv_p_var = 1e4 / momentum.powi(4);
        SpectrometerTrack {
            slope_x,
            slope_y,
            x: vertex.x + dz * slope_x,
            y: vertex.y + dz * slope_y,
            momentum,
            charge,
            cov: Matrix5::from_diagonal(&Vector5::new(1e-8, 1e-8, 1., 1., inv_p_var)),
        }
    }

    fn common_vertex_tracks(vertex: Vector3<f64>) -> Vec<SpectrometerTrack<f64>> {
        vec![
            track_through(vertex, 0.001, -0.002, 10000., 1),
            track_through(vertex, 0.0, 0.003, 12000., -1),
            track_through(vertex, -0.001, 0.001, 9000., 1),
        ]
    }

    /// A fourth track displaced far from the others' common vertex.
    fn outlier_track() -> SpectrometerTrack<f64> {
        track_through(Vector3::new(500., -300., 90000.), 0.004, 0.002, 15000., -1)
    }

    #[test]
    fn end_to_end_three_track_vertex() {
        let vertex = Vector3::new(0., 0., 5000.);
        let tracks = common_vertex_tracks(vertex);

        let vertices = VertexBuilder::new(&tracks).build();

        assert_eq!(vertices.len(), 1);
        let vtx = &vertices[0];
        assert_eq!(vtx.n_tracks(), 3);
        assert_eq!(vtx.charge, 1);
        assert!(vtx.chi2 < 1e-6);
        assert_abs_diff_eq!(vtx.position, vertex, epsilon = 1e-6);

        // Total momentum is the vector sum of the three track momenta along
        // their respective slopes; with a perfect fit the prefit and fitted
        // momenta agree.
        let expected: Vector3<f64> = tracks.iter().map(|t| t.three_momentum()).sum();
        assert_abs_diff_eq!(vtx.total_momentum, expected, epsilon = 1e-6);
        for (i, member) in vtx.tracks.iter().enumerate() {
            assert_eq!(member.index, i);
            assert_abs_diff_eq!(member.momentum, member.momentum_prefit, epsilon = 1e-6);
        }
    }

    #[test]
    fn only_the_good_subset_is_accepted() {
        // Four tracks of which only (0, 1, 2) share a vertex; with a tight
        // threshold only that subset survives the three-track search.
        let vertex = Vector3::new(0., 0., 5000.);
        let mut tracks = common_vertex_tracks(vertex);
        tracks.push(outlier_track());

        let vertices = VertexBuilder::new(&tracks).with_max_chi2(10.).build();

        assert_eq!(vertices.len(), 1);
        assert_eq!(vertices[0].n_tracks(), 3);
        let indices: Vec<usize> = vertices[0].tracks.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn enabling_two_track_search_keeps_the_three_track_vertex() {
        let vertex = Vector3::new(0., 0., 5000.);
        let mut tracks = common_vertex_tracks(vertex);
        tracks.push(outlier_track());

        let vertices = VertexBuilder::new(&tracks)
            .with_group_size(2)
            .with_max_chi2(10.)
            .build();

        let three_track: Vec<&Vertex<f64>> =
            vertices.iter().filter(|v| v.n_tracks() == 3).collect();
        assert_eq!(three_track.len(), 1);
        let indices: Vec<usize> = three_track[0].tracks.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        // The pairs within the common-vertex triplet pass as well.
        assert!(vertices.iter().any(|v| v.n_tracks() == 2));
    }

    #[test]
    fn too_many_tracks_abandons_the_search() {
        let vertex = Vector3::new(0., 0., 5000.);
        let tracks = common_vertex_tracks(vertex);

        let vertices = VertexBuilder::new(&tracks).with_max_tracks(2).build();

        assert!(vertices.is_empty());
    }

    #[test]
    fn too_few_tracks_is_not_an_error() {
        let tracks = vec![track_through(Vector3::new(0., 0., 5000.), 0.001, 0., 10000., 1)];
        assert!(VertexBuilder::new(&tracks).build().is_empty());
        assert!(VertexBuilder::<f64>::new(&[]).build().is_empty());
    }

    #[test]
    fn vertex_cap_truncates_output() {
        // Five tracks through one point: C(5,2) = 10 two-track candidates
        // all pass, but only two may be kept.
        let vertex = Vector3::new(0., 0., 5000.);
        let mut tracks = common_vertex_tracks(vertex);
        tracks.push(track_through(vertex, 0.002, 0.001, 11000., 1));
        tracks.push(track_through(vertex, -0.002, -0.001, 13000., -1));

        let vertices = VertexBuilder::new(&tracks)
            .with_no_group_sizes()
            .with_group_size(2)
            .with_max_vertices(2)
            .build();

        assert_eq!(vertices.len(), 2);
        // Lexicographic enumeration: (0,1) then (0,2).
        assert_eq!(
            vertices[0].tracks.iter().map(|t| t.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            vertices[1].tracks.iter().map(|t| t.index).collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn zero_vertex_cap_yields_no_vertices() {
        // Three tracks sharing a vertex would be accepted, but the cap
        // forbids keeping any.
        let tracks = common_vertex_tracks(Vector3::new(0., 0., 5000.));
        let builder = VertexBuilder::new(&tracks).with_max_vertices(0);

        assert!(builder.build().is_empty());
        #[cfg(feature = "parallel")]
        assert_eq!(builder.build(), builder.build_par());
    }

    #[test]
    fn singular_covariance_skips_the_combination() {
        let vertex = Vector3::new(0., 0., 5000.);
        let mut tracks = common_vertex_tracks(vertex);
        tracks[2].cov = Matrix5::zeros();

        let vertices = VertexBuilder::new(&tracks).build();

        assert!(vertices.is_empty());

        // Pairs not involving the broken track still fit.
        let vertices = VertexBuilder::new(&tracks)
            .with_no_group_sizes()
            .with_group_size(2)
            .build();
        assert_eq!(vertices.len(), 1);
        assert_eq!(
            vertices[0].tracks.iter().map(|t| t.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn charge_is_the_signed_sum() {
        let vertex = Vector3::new(0., 0., 5000.);
        let tracks = vec![
            track_through(vertex, 0.001, -0.002, 10000., -1),
            track_through(vertex, 0.0, 0.003, 12000., -1),
            track_through(vertex, -0.001, 0.001, 9000., -1),
        ];

        let vertices = VertexBuilder::new(&tracks).build();

        assert_eq!(vertices.len(), 1);
        assert_eq!(vertices[0].charge, -3);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_search_agrees_with_serial() {
        let vertex = Vector3::new(0., 0., 5000.);
        let mut tracks = common_vertex_tracks(vertex);
        tracks.push(outlier_track());
        tracks.push(track_through(vertex, 0.002, 0.001, 11000., 1));

        let builder = VertexBuilder::new(&tracks)
            .with_group_size(2)
            .with_group_size(4)
            .with_max_chi2(10.);

        let serial = builder.build();
        let parallel = builder.build_par();

        assert_eq!(serial, parallel);
    }
}
