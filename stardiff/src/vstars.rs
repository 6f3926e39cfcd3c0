//! Symmetry-adapted vector stars and the projection ("expansion") tensors
//! built on top of them.
//!
//! Each star contributes one vector star per dimension of the vector space
//! left invariant by its little group: the parallel field always survives,
//! perpendicular fields survive only when the little group permits. The
//! expansions project rates, drift biases, bare diffusivity, and lattice
//! Green-function entries onto this orthonormal basis, turning the transport
//! problem into small dense matrices.

use crate::crystal::Crystal;
use crate::error::{Error, Result};
use crate::starset::{JumpNetwork, StarSet};
use nalgebra::Vector3;
use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

const TOL: f64 = 1e-8;

/// Rate expansions for a derived jump network together with the reference
/// expansions against the parent ω₀ types.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RateExpansions {
    /// Reference ω₀ projection, `[Nv, Nv, Nω0]`.
    pub rate0: Array3<f64>,
    /// Reference escape terms, `[Nv, Nω0]`.
    pub rate0_escape: Array2<f64>,
    /// Network projection, `[Nv, Nv, Nω]`.
    pub rate1: Array3<f64>,
    /// Escape terms, `[Nv, Nω]`.
    pub rate1_escape: Array2<f64>,
}

/// Bias (drift) expansions for a derived jump network and its ω₀ reference.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BiasExpansions {
    /// Reference ω₀ geometric bias, `[Nv, Nω0]`.
    pub bias0: Array2<f64>,
    /// Network geometric bias, `[Nv, Nω]`.
    pub bias1: Array2<f64>,
}

/// Bare-diffusivity expansions, `½·Σ dx⊗dx` per jump orbit.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BareExpansions {
    /// Accumulated onto the parent ω₀ types, `[3, 3, Nω0]`.
    pub d0: Array3<f64>,
    /// Per network orbit, `[3, 3, Nω]`.
    pub d1: Array3<f64>,
}

/// The orthonormal symmetry-adapted vector basis over a star set.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VectorStarSet {
    vecpos: Vec<Vec<usize>>,
    vecvec: Vec<Vec<Vector3<f64>>>,
    outer: Array4<f64>,
}

impl VectorStarSet {
    /// Builds the vector stars for `starset`.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] if the star set has no shells, and
    /// [`Error::General`] if the little-group sweep produces an unnormalized
    /// vector (which would indicate a broken group).
    pub fn new(starset: &StarSet) -> Result<Self> {
        if starset.nshells() < 1 {
            return Err(Error::ShellNotInitialized);
        }
        let crys = starset.crystal();
        let chem = starset.chem();
        let states = starset.states();
        let mut vecpos: Vec<Vec<usize>> = Vec::new();
        let mut vecvec: Vec<Vec<Vector3<f64>>> = Vec::new();

        for star in starset.stars() {
            let ps0 = states[star[0]];
            #[allow(clippy::cast_precision_loss)]
            let star_len = star.len() as f64;
            if ps0.is_zero() {
                // origin star: vectors come from the site's vector basis
                let vlist = Crystal::vect_list(crys.vector_basis((chem, ps0.i)));
                let scale = 1.0 / star_len.sqrt();
                for v in vlist {
                    vecpos.push(star.clone());
                    vecvec.push(populate(starset, star, &ps0, &(v * scale)));
                }
                continue;
            }
            // parallel vector star, always present
            let vpara = ps0.dx;
            let scale = 1.0 / (star_len * vpara.norm_squared()).sqrt();
            vecpos.push(star.clone());
            vecvec.push(star.iter().map(|&si| states[si].dx * scale).collect());

            // perpendicular candidates, filtered by the little group
            let mut v0 = vpara.cross(&Vector3::z());
            if v0.norm_squared() < TOL {
                v0 = vpara.cross(&Vector3::x());
            }
            let mut v1 = vpara.cross(&v0);
            v0.normalize_mut();
            v1.normalize_mut();
            let mut nvect = 2_usize;
            for g in crys.group() {
                if nvect == 0 {
                    break;
                }
                if ps0.apply(crys, chem, g) != ps0 {
                    continue;
                }
                let gv0 = Crystal::g_direc(g, &v0);
                if nvect == 1 {
                    if (v0.norm_squared() - 1.0).abs() > TOL {
                        return Err(Error::General(
                            "little-group sweep lost normalization".to_owned(),
                        ));
                    }
                    if (gv0 - v0).norm() > TOL {
                        nvect = 0;
                    }
                } else {
                    let gv1 = Crystal::g_direc(g, &v1);
                    let (g00, g11) = (v0.dot(&gv0), v1.dot(&gv1));
                    let (g01, g10) = (v0.dot(&gv1), v1.dot(&gv0));
                    if ((g00 * g11 - g01 * g10).abs() - 1.0).abs() > TOL
                        || (g01 - g10).abs() > TOL
                    {
                        // not orthogonal, or a proper rotation: nothing survives
                        nvect = 0;
                        continue;
                    }
                    if (g00 - 1.0).abs() > TOL || (g11 - 1.0).abs() > TOL {
                        if (g00 - 1.0).abs() < TOL {
                            nvect = 1;
                        } else if (g11 - 1.0).abs() < TOL {
                            v0 = v1;
                            nvect = 1;
                        } else {
                            v0 = (g01 * v0 + (1.0 - g00) * v1)
                                / (g01 * g10 + (1.0 - g00).powi(2)).sqrt();
                            nvect = 1;
                        }
                    }
                }
            }
            if nvect > 0 {
                let scale0 = 1.0 / (star_len * v0.norm_squared()).sqrt();
                vecpos.push(star.clone());
                vecvec.push(populate(starset, star, &ps0, &(v0 * scale0)));
                if nvect > 1 {
                    let scale1 = 1.0 / (star_len * v1.norm_squared()).sqrt();
                    vecpos.push(star.clone());
                    vecvec.push(populate(starset, star, &ps0, &(v1 * scale1)));
                }
            }
        }

        let outer = generate_outer(&vecpos, &vecvec);
        Ok(Self {
            vecpos,
            vecvec,
            outer,
        })
    }

    /// Number of vector stars.
    #[must_use]
    pub fn nvstars(&self) -> usize {
        self.vecpos.len()
    }

    /// State indices per vector star.
    #[must_use]
    pub fn vecpos(&self) -> &[Vec<usize>] {
        &self.vecpos
    }

    /// Vectors per vector star, parallel to [`Self::vecpos`].
    #[must_use]
    pub fn vecvec(&self) -> &[Vec<Vector3<f64>>] {
        &self.vecvec
    }

    /// Outer-product table `outer[a, b, α, β] = Σ v_α ⊗ v_β`, nonzero only
    /// when `α` and `β` live on the same star.
    #[must_use]
    pub const fn outer(&self) -> &Array4<f64> {
        &self.outer
    }

    /// Projects the lattice Green function onto the vector-star basis:
    /// returns `GFexpansion[α, β, k]` indexed by the stars of the
    /// endpoint-difference star set, which is returned alongside.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfShell`] if a difference state is missing from the
    /// difference star set.
    pub fn gf_expansion(&self, starset: &StarSet) -> Result<(Array3<f64>, StarSet)> {
        let gfstarset = StarSet::diffgenerate(starset, starset)?;
        let nv = self.nvstars();
        let states = starset.states();
        let mut expansion = Array3::zeros((nv, nv, gfstarset.nstars()));
        for i in 0..nv {
            for (&si, vi) in self.vecpos[i].iter().zip(&self.vecvec[i]) {
                for j in i..nv {
                    for (&sj, vj) in self.vecpos[j].iter().zip(&self.vecvec[j]) {
                        let Ok(ds) = states[sj].endpoint_sub(&states[si]) else {
                            continue;
                        };
                        let k = gfstarset
                            .starindex(&ds)
                            .ok_or_else(|| Error::OutOfShell(ds.to_string()))?;
                        expansion[[i, j, k]] += vi.dot(vj);
                    }
                }
            }
        }
        // symmetrize the lower triangle
        for i in 0..nv {
            for j in 0..i {
                for k in 0..gfstarset.nstars() {
                    expansion[[i, j, k]] = expansion[[j, i, k]];
                }
            }
        }
        Ok((expansion, gfstarset))
    }

    /// Projects a derived jump network (and its ω₀ reference) onto the
    /// vector-star basis, separating diagonal escape terms.
    #[must_use]
    pub fn rate_expansions(&self, starset: &StarSet, network: &JumpNetwork) -> RateExpansions {
        let nv = self.nvstars();
        let n0 = starset.jumpnetwork_index().len();
        let nj = network.len();
        let mut exp = RateExpansions {
            rate0: Array3::zeros((nv, nv, n0)),
            rate0_escape: Array2::zeros((nv, n0)),
            rate1: Array3::zeros((nv, nv, nj)),
            rate1_escape: Array2::zeros((nv, nj)),
        };
        for (k, (orbit, &jt)) in network.jumps.iter().zip(&network.jumptype).enumerate() {
            for &((is_, fs), _) in orbit {
                for i in 0..nv {
                    for (&ri, vi) in self.vecpos[i].iter().zip(&self.vecvec[i]) {
                        if ri != is_ {
                            continue;
                        }
                        let v2 = vi.dot(vi);
                        exp.rate0_escape[[i, jt]] -= v2;
                        exp.rate1_escape[[i, k]] -= v2;
                        for j in 0..nv {
                            for (&rj, vj) in self.vecpos[j].iter().zip(&self.vecvec[j]) {
                                if rj == fs {
                                    let vv = vi.dot(vj);
                                    exp.rate0[[i, j, jt]] += vv;
                                    exp.rate1[[i, j, k]] += vv;
                                }
                            }
                        }
                    }
                }
            }
        }
        exp
    }

    /// Projects the geometric drift bias of a derived jump network (and its
    /// ω₀ reference) onto the vector-star basis.
    #[must_use]
    pub fn bias_expansions(&self, starset: &StarSet, network: &JumpNetwork) -> BiasExpansions {
        let nv = self.nvstars();
        let mut exp = BiasExpansions {
            bias0: Array2::zeros((nv, starset.jumpnetwork_index().len())),
            bias1: Array2::zeros((nv, network.len())),
        };
        for (k, (orbit, &jt)) in network.jumps.iter().zip(&network.jumptype).enumerate() {
            for &((is_, _), dx) in orbit {
                for i in 0..nv {
                    if self.vecpos[i][0] == is_ {
                        #[allow(clippy::cast_precision_loss)]
                        let geom = self.vecvec[i][0].dot(&dx) * self.vecpos[i].len() as f64;
                        exp.bias0[[i, jt]] += geom;
                        exp.bias1[[i, k]] += geom;
                    }
                }
            }
        }
        exp
    }

    /// Bare-diffusivity expansion `½·Σ dx⊗dx` per jump orbit, accumulated
    /// both per network orbit and onto the parent ω₀ types.
    #[must_use]
    pub fn bare_expansions(&self, starset: &StarSet, network: &JumpNetwork) -> BareExpansions {
        let mut exp = BareExpansions {
            d0: Array3::zeros((3, 3, starset.jumpnetwork_index().len())),
            d1: Array3::zeros((3, 3, network.len())),
        };
        for (k, (orbit, &jt)) in network.jumps.iter().zip(&network.jumptype).enumerate() {
            for &(_, dx) in orbit {
                for a in 0..3 {
                    for b in 0..3 {
                        let d = 0.5 * dx[a] * dx[b];
                        exp.d0[[a, b, jt]] += d;
                        exp.d1[[a, b, k]] += d;
                    }
                }
            }
        }
        exp
    }
}

/// Carries the representative vector `v` onto every member of `star` by the
/// group operation that maps the representative state there.
fn populate(
    starset: &StarSet,
    star: &[usize],
    ps0: &crate::pairstate::PairState,
    v: &Vector3<f64>,
) -> Vec<Vector3<f64>> {
    let crys = starset.crystal();
    let chem = starset.chem();
    star.iter()
        .map(|&si| {
            let psi = starset.states()[si];
            crys.group()
                .iter()
                .find(|g| ps0.apply(crys, chem, g) == psi)
                .map(|g| Crystal::g_direc(g, v))
                // UNWRAP: every star member is an image of the representative
                .unwrap_or_else(|| unreachable!())
        })
        .collect()
}

fn generate_outer(vecpos: &[Vec<usize>], vecvec: &[Vec<Vector3<f64>>]) -> Array4<f64> {
    let nv = vecpos.len();
    let mut outer = Array4::zeros((3, 3, nv, nv));
    for i in 0..nv {
        for j in 0..nv {
            if vecpos[i][0] != vecpos[j][0] {
                continue;
            }
            for (v0, v1) in vecvec[i].iter().zip(&vecvec[j]) {
                for a in 0..3 {
                    for b in 0..3 {
                        outer[[a, b, i, j]] += v0[a] * v1[b];
                    }
                }
            }
        }
    }
    outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fcc_vstars(nshells: usize) -> (StarSet, VectorStarSet) {
        let crys = Arc::new(Crystal::fcc(1.0).unwrap());
        let jn = crys.jumpnetwork(0, 0.75);
        let set = StarSet::new(crys, 0, &jn, nshells);
        let vs = VectorStarSet::new(&set).unwrap();
        (set, vs)
    }

    #[test]
    fn fcc_vector_star_counts() {
        // the <110> star has a C2v little group: only the parallel field
        let (_, vs) = fcc_vstars(1);
        assert_eq!(vs.nvstars(), 1);
        // <110>: 1, <200>: 1, <211>: 1+1 perpendicular, <220>: 1
        let (_, vs2) = fcc_vstars(2);
        assert_eq!(vs2.nvstars(), 5);
    }

    #[test]
    fn vector_stars_are_orthonormal() {
        let (_, vs) = fcc_vstars(2);
        let nv = vs.nvstars();
        for i in 0..nv {
            for j in 0..nv {
                let mut dot = 0.0;
                if vs.vecpos()[i][0] == vs.vecpos()[j][0] {
                    for (vi, vj) in vs.vecvec()[i].iter().zip(&vs.vecvec()[j]) {
                        dot += vi.dot(vj);
                    }
                }
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (dot - expected).abs() < 1e-8,
                    "vector stars {i} and {j} have overlap {dot}"
                );
            }
        }
    }

    #[test]
    fn vector_stars_are_group_invariant() {
        let (set, vs) = fcc_vstars(2);
        let crys = Arc::clone(set.crystal());
        for g in crys.group() {
            for (positions, vectors) in vs.vecpos().iter().zip(vs.vecvec()) {
                for (&si, v) in positions.iter().zip(vectors) {
                    let gs = set.states()[si].apply(&crys, 0, g);
                    let gsi = set.stateindex(&gs).unwrap();
                    let slot = positions.iter().position(|&p| p == gsi).unwrap();
                    let gv = Crystal::g_direc(g, v);
                    assert!((vectors[slot] - gv).norm() < 1e-8);
                }
            }
        }
    }

    #[test]
    fn outer_products_stay_within_stars() {
        let (_, vs) = fcc_vstars(2);
        let nv = vs.nvstars();
        for i in 0..nv {
            for j in 0..nv {
                if vs.vecpos()[i][0] != vs.vecpos()[j][0] {
                    for a in 0..3 {
                        for b in 0..3 {
                            assert_eq!(vs.outer()[[a, b, i, j]], 0.0);
                        }
                    }
                }
            }
        }
        // diagonal blocks have trace one (orthonormality folded into 3x3)
        for i in 0..nv {
            let trace: f64 = (0..3).map(|a| vs.outer()[[a, a, i, i]]).sum();
            assert!((trace - 1.0).abs() < 1e-8);
        }
    }

    #[test]
    fn gf_expansion_is_symmetric() {
        let (set, vs) = fcc_vstars(1);
        let (exp, gfstars) = vs.gf_expansion(&set).unwrap();
        assert!(gfstars.nstars() > 1);
        let nv = vs.nvstars();
        for i in 0..nv {
            for j in 0..nv {
                for k in 0..gfstars.nstars() {
                    assert!((exp[[i, j, k]] - exp[[j, i, k]]).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn rate_and_bias_expansion_shapes() {
        let (set, vs) = fcc_vstars(2);
        let om1 = set.jumpnetwork_omega1();
        let rates = vs.rate_expansions(&set, &om1);
        assert_eq!(rates.rate1.shape(), &[vs.nvstars(), vs.nvstars(), om1.len()]);
        assert_eq!(rates.rate0.shape()[2], set.jumpnetwork_index().len());
        let bias = vs.bias_expansions(&set, &om1);
        assert_eq!(bias.bias1.shape(), &[vs.nvstars(), om1.len()]);
        let bare = vs.bare_expansions(&set, &om1);
        assert_eq!(bare.d1.shape(), &[3, 3, om1.len()]);
        // escape entries are non-positive by construction
        assert!(rates.rate1_escape.iter().all(|&x| x <= 1e-12));
    }
}
