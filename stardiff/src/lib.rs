//! `stardiff` computes Onsager transport coefficients for dilute
//! vacancy-mediated solute diffusion and for interstitial diffusion in
//! crystalline solids.
//!
//! The calculation is organized around the crystallographic symmetry of the
//! host lattice: solute-vacancy configurations are enumerated as pair states,
//! grouped into point-group orbits ("stars"), and equipped with an
//! orthonormal symmetry-adapted vector basis. Rates, drift biases, and
//! lattice Green-function entries are projected onto that basis, reducing the
//! transport problem to a small dense linear solve per thermodynamic input.

pub mod crystal;
pub mod error;
pub mod gf;
pub mod interstitial;
pub mod pairstate;
pub mod starset;
pub mod vacancy;
pub mod vstars;
