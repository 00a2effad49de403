#![warn(missing_docs)]

//! Least-squares fitting of multi-track decay vertices for a fixed-target
//! spectrometer. \
//! Tracks are parametrised at a common reference plane by a 5D state
//! `(dx/dz, dy/dz, x, y, P)` with its covariance matrix. The fit finds the 3D
//! vertex position and refined per-track momenta that minimise the total
//! weighted residual, following the linearised block-matrix method of
//! Billoir, Fruhwirth and Regler (Nucl. Instr. Meth. A241 (1985) 115).
//!
//! ## Interface
//! The central struct of this library is [`VertexBuilder`]. Given the event's
//! track collection, it enumerates all combinations of the enabled group
//! sizes (2 to 5 tracks), runs the least-squares fit on each and keeps the
//! combinations whose chi2 passes the quality cut. Parameters are set via
//! `VertexBuilder::with_*()` functions.
//!
//! Example:
//! ```rust
//! # use nalgebra::Matrix5;
//! # use vertexls::{SpectrometerTrack, VertexBuilder};
//! # let cov = Matrix5::<f64>::from_diagonal(&nalgebra::Vector5::new(1e-8, 1e-8, 1., 1., 1e-10));
//! # let track = |sx: f64, sy: f64, p: f64| SpectrometerTrack {
//! #     slope_x: sx, slope_y: sy,
//! #     x: sx * 175000., y: sy * 175000.,
//! #     momentum: p, charge: 1, cov,
//! # };
//! # let tracks = [track(0.001, -0.002, 10000.), track(0.0, 0.003, 12000.), track(-0.001, 0.001, 9000.)];
//! let vertices = VertexBuilder::new(&tracks)
//!     .with_group_size(3)
//!     .with_max_chi2(100.)
//!     .build();
//! for vertex in &vertices {
//!     println!("chi2 = {}, z = {}", vertex.chi2, vertex.position.z);
//! }
//! ```
//!
//! The fit engine itself, [`VertexFit`], can also be driven directly: add the
//! tracks of one candidate, run a fixed number of iterations, query the
//! vertex position, per-track momenta and covariances, and optionally apply a
//! total-momentum constraint ([`VertexFit::apply_momentum_constraint()`])
//! against a known parent momentum.
//!
//! ## Parameters
//! - `max_chi2`: Combinations with a fit chi2 above this value are discarded.
//! - `max_tracks`: Events with more tracks than this are skipped entirely;
//!     the number of combinations grows too fast to be worth attempting.
//! - `max_vertices`: Cap on the accepted vertex collection. Further
//!     acceptable combinations are silently dropped.
//! - `z_ref`: Longitudinal position of the track parametrisation reference
//!     plane, in mm.
//! - `iterations`: Fixed number of fit iterations. No convergence test is
//!     performed; straight-track geometry is near-linear and the default of 3
//!     is sufficient.

pub(crate) mod builder;
pub(crate) mod fitter;
pub(crate) mod geometry;
pub(crate) mod track;
pub(crate) mod vertex;

pub use builder::VertexBuilder;
pub use fitter::{MomentumConstraint, VertexFit, DEFAULT_ITERATIONS, DEFAULT_Z_REF};
pub use geometry::{closest_approach, seed_vertex, ClosestApproach, Line};
pub use track::{SpectrometerTrack, TrackState};
pub use vertex::{Vertex, VertexTrack};

/// A generic float trait such that the vertex fit is generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
/// [`num_traits::Float`] is not a supertrait as the need to specify the provider of the redundant definitions of the basic math functions would clutter the code.
pub trait Float: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}

impl<F> Float for F where F: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive {}
