//! Accepted vertex records.

use nalgebra::Vector3;

use crate::Float;

/// One member track of an accepted vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexTrack<F: Float> {
    /// Index of the track in the event's input collection.
    pub index: usize,
    /// Fitted three-momentum.
    pub momentum: Vector3<F>,
    /// Three-momentum recomputed from the raw track parameters, before the
    /// vertex fit correction.
    pub momentum_prefit: Vector3<F>,
}

/// An accepted vertex candidate.
///
/// Immutable snapshot built once per accepted track combination; the
/// per-event collection is rebuilt from empty by every
/// [`VertexBuilder::build()`](crate::VertexBuilder::build()) call.
#[derive(Clone, Debug, PartialEq)]
pub struct Vertex<F: Float> {
    /// Sum of the signed charges of the member tracks.
    pub charge: i32,
    /// Fitted vertex position.
    pub position: Vector3<F>,
    /// Chi2 of the vertex fit.
    pub chi2: F,
    /// Vector sum of the fitted track three-momenta.
    pub total_momentum: Vector3<F>,
    /// Member tracks, ordered by input index.
    pub tracks: Vec<VertexTrack<F>>,
}

impl<F: Float> Vertex<F> {
    /// Number of tracks forming the vertex.
    pub fn n_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Magnitude of the total three-momentum.
    pub fn total_momentum_mag(&self) -> F {
        self.total_momentum.norm()
    }

    /// Input-collection index of member track `i`.
    pub fn track_index(&self, i: usize) -> usize {
        self.tracks[i].index
    }

    /// Fitted three-momentum of member track `i`.
    pub fn track_momentum(&self, i: usize) -> Vector3<F> {
        self.tracks[i].momentum
    }
}
