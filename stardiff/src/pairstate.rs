//! Pair-state algebra: ordered solute-vacancy configurations with a
//! connecting lattice vector.
//!
//! A [`PairState`] places its first member in the origin cell at site `i` and
//! its second member in cell `r` at site `j`; `dx` is the Cartesian vector
//! between them and is always derivable from the crystal geometry, so
//! equality and hashing ignore it.

use crate::crystal::{Crystal, GroupOp};
use crate::error::{Error, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Neg;

/// An ordered pair of sites with the lattice vector connecting their cells.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PairState {
    /// Site index of the first member (origin cell).
    pub i: usize,
    /// Site index of the second member (cell `r`).
    pub j: usize,
    /// Lattice translation from the cell of `i` to the cell of `j`.
    pub r: [i64; 3],
    /// Cartesian vector from the first to the second member.
    pub dx: Vector3<f64>,
}

impl PartialEq for PairState {
    fn eq(&self, other: &Self) -> bool {
        self.i == other.i && self.j == other.j && self.r == other.r
    }
}

impl Eq for PairState {}

impl Hash for PairState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.i.hash(state);
        self.j.hash(state);
        self.r.hash(state);
    }
}

impl PairState {
    /// The zero state on site `n`.
    #[must_use]
    pub fn zero(n: usize) -> Self {
        Self {
            i: n,
            j: n,
            r: [0, 0, 0],
            dx: Vector3::zeros(),
        }
    }

    /// Builds a pair state from a jump `((i, j), dx)`, recovering the lattice
    /// vector from the crystal geometry.
    #[must_use]
    pub fn from_jump(
        crys: &Crystal,
        chem: usize,
        (i, j): (usize, usize),
        dx: Vector3<f64>,
    ) -> Self {
        let frac = crys.invlatt() * dx - crys.basis()[chem][j] + crys.basis()[chem][i];
        #[allow(clippy::cast_possible_truncation)]
        let r = [
            frac[0].round() as i64,
            frac[1].round() as i64,
            frac[2].round() as i64,
        ];
        Self { i, j, r, dx }
    }

    /// Builds a pair state from sites and a lattice vector.
    #[must_use]
    pub fn from_lattice(crys: &Crystal, chem: usize, (i, j): (usize, usize), r: [i64; 3]) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let rvec = Vector3::new(r[0] as f64, r[1] as f64, r[2] as f64);
        let dx = crys.lattice() * (rvec + crys.basis()[chem][j] - crys.basis()[chem][i]);
        Self { i, j, r, dx }
    }

    /// `true` for a zero state (`i == j`, `r == 0`).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.i == self.j && self.r == [0, 0, 0]
    }

    /// Composes two states: `(i,j) R + (j,k) R' = (i,k) R+R'`.
    ///
    /// # Errors
    ///
    /// [`Error::NotComposable`] unless `self.j == other.i`.
    pub fn compose(&self, other: &Self) -> Result<Self> {
        if self.j != other.i {
            return Err(Error::NotComposable {
                left: self.j,
                right: other.i,
            });
        }
        Ok(Self {
            i: self.i,
            j: other.j,
            r: [
                self.r[0] + other.r[0],
                self.r[1] + other.r[1],
                self.r[2] + other.r[2],
            ],
            dx: self.dx + other.dx,
        })
    }

    /// Subtracts on the final endpoint: `(i,j) R − (k,j) R' = (i,k) R−R'`,
    /// so that `(a − b) + b = a`.
    ///
    /// # Errors
    ///
    /// [`Error::NotComposable`] unless both states share the final endpoint.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.compose(&-*other)
    }

    /// Subtracts on the initial endpoint: `(i,j) R ^ (i,k) R' = (k,j) R−R'`,
    /// so that `b + (a ^ b) = a`. This is the form the Green-function
    /// difference stars are built from.
    ///
    /// # Errors
    ///
    /// [`Error::NotComposable`] unless both states share the initial
    /// endpoint.
    pub fn endpoint_sub(&self, other: &Self) -> Result<Self> {
        if self.i != other.i {
            return Err(Error::NotComposable {
                left: self.i,
                right: other.i,
            });
        }
        Ok(Self {
            i: other.j,
            j: self.j,
            r: [
                self.r[0] - other.r[0],
                self.r[1] - other.r[1],
                self.r[2] - other.r[2],
            ],
            dx: self.dx - other.dx,
        })
    }

    /// Applies the group operation `g`, recomputing `r` and `dx`.
    #[must_use]
    pub fn apply(&self, crys: &Crystal, chem: usize, g: &GroupOp) -> Self {
        let (ri, (_, gi)) = crys.g_pos(g, [0, 0, 0], (chem, self.i));
        let (rj, (_, gj)) = crys.g_pos(g, self.r, (chem, self.j));
        Self {
            i: gi,
            j: gj,
            r: [rj[0] - ri[0], rj[1] - ri[1], rj[2] - ri[2]],
            dx: Crystal::g_direc(g, &self.dx),
        }
    }

    /// Squared Cartesian separation; the sort key for shell ordering.
    #[must_use]
    pub fn norm2(&self) -> f64 {
        self.dx.norm_squared()
    }

    /// `true` if `dx` is consistent with `(i, j, r)` on this crystal.
    #[must_use]
    pub fn is_sane(&self, crys: &Crystal, chem: usize) -> bool {
        (Self::from_lattice(crys, chem, (self.i, self.j), self.r).dx - self.dx).norm() < 1e-8
    }
}

impl Neg for PairState {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            i: self.j,
            j: self.i,
            r: [-self.r[0], -self.r[1], -self.r[2]],
            dx: -self.dx,
        }
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.[0,0,0]:{}.[{},{},{}] (dx=[{},{},{}])",
            self.i, self.j, self.r[0], self.r[1], self.r[2], self.dx[0], self.dx[1], self.dx[2]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn fcc_states() -> (Crystal, Vec<PairState>) {
        let crys = Crystal::fcc(1.0).unwrap();
        let jn = crys.jumpnetwork(0, 0.75);
        let states = jn[0]
            .iter()
            .map(|&(ij, dx)| PairState::from_jump(&crys, 0, ij, dx))
            .collect();
        (crys, states)
    }

    #[test]
    fn composition_is_associative() {
        let (_, states) = fcc_states();
        for a in &states {
            for b in &states {
                for c in &states {
                    let lhs = a.compose(b).unwrap().compose(c).unwrap();
                    let rhs = a.compose(&b.compose(c).unwrap()).unwrap();
                    assert_eq!(lhs, rhs);
                    assert!((lhs.dx - rhs.dx).norm() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn negation_yields_zero() {
        let (_, states) = fcc_states();
        for a in &states {
            assert_eq!(a.compose(&-*a).unwrap(), PairState::zero(a.i));
            assert_eq!((-*a).compose(a).unwrap(), PairState::zero(a.j));
        }
    }

    #[test]
    fn group_action_distributes_over_composition() {
        let (crys, states) = fcc_states();
        for g in crys.group() {
            for a in &states {
                for b in &states {
                    let lhs = a.compose(b).unwrap().apply(&crys, 0, g);
                    let rhs = a
                        .apply(&crys, 0, g)
                        .compose(&b.apply(&crys, 0, g))
                        .unwrap();
                    assert_eq!(lhs, rhs);
                    assert!((lhs.dx - rhs.dx).norm() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn subtraction_identities() {
        let (_, states) = fcc_states();
        for a in &states {
            for b in &states {
                let ab = a.compose(b).unwrap();
                // (x − b) + b = x
                let diff = ab.sub(b).unwrap();
                assert_eq!(diff.compose(b).unwrap(), ab);
                // b + (x ^ b) = x for x, b sharing the initial endpoint
                let x = *a;
                let edge = x.endpoint_sub(b).unwrap();
                assert_eq!(b.compose(&edge).unwrap(), x);
            }
        }
    }

    #[test]
    fn composition_rejects_mismatched_endpoints() {
        let crys = Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap();
        let a = PairState::from_lattice(&crys, 0, (0, 0), [1, 0, 0]);
        let b = PairState::from_lattice(&crys, 0, (1, 0), [0, 0, 0]);
        assert!(matches!(
            a.compose(&b),
            Err(Error::NotComposable { left: 0, right: 1 })
        ));
        assert!(a.endpoint_sub(&b).is_err());
    }

    #[test]
    fn equality_and_hash_ignore_dx() {
        let (_, states) = fcc_states();
        let a = states[0];
        let mut b = a;
        b.dx += Vector3::new(0.25, 0.0, 0.0);
        assert_eq!(a, b);

        let hash = |ps: &PairState| {
            let mut h = DefaultHasher::new();
            ps.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
        assert_ne!(a, -a);
    }

    #[test]
    fn sanity_check_tracks_geometry() {
        let (crys, states) = fcc_states();
        for a in &states {
            assert!(a.is_sane(&crys, 0));
            let mut broken = *a;
            broken.dx += Vector3::new(0.5, 0.0, 0.0);
            assert!(!broken.is_sane(&crys, 0));
        }
    }
}
