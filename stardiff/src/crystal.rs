//! Crystal structures, space-group operations, and symmetry-adapted bases.
//!
//! A [`Crystal`] owns the primitive lattice, the fractional basis of every
//! chemical species, and the full list of space-group operations, which are
//! generated by brute force: integer rotations in lattice coordinates that
//! preserve the metric tensor, combined with the fractional translations that
//! map the basis onto itself.

use crate::error::{Error, Result};
use itertools::iproduct;
use nalgebra::{Matrix3, Vector3};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Threshold for geometric comparisons (fractional coordinates, metrics).
pub const SYMM_TOL: f64 = 1e-8;

/// A space-group operation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupOp {
    /// Rotation in lattice (fractional) coordinates; unimodular integer matrix.
    pub rot: [[i64; 3]; 3],
    /// The same rotation expressed in Cartesian coordinates.
    pub cartrot: Matrix3<f64>,
    /// Fractional translation, wrapped into `[0, 1)`.
    pub trans: Vector3<f64>,
    /// `indexmap[chem][i]` is the site index that site `i` of species `chem`
    /// is carried onto.
    pub indexmap: Vec<Vec<usize>>,
}

impl GroupOp {
    fn rot_f64(&self) -> Matrix3<f64> {
        let r = &self.rot;
        #[allow(clippy::cast_precision_loss)]
        let m = Matrix3::new(
            r[0][0] as f64,
            r[0][1] as f64,
            r[0][2] as f64,
            r[1][0] as f64,
            r[1][1] as f64,
            r[1][2] as f64,
            r[2][0] as f64,
            r[2][1] as f64,
            r[2][2] as f64,
        );
        m
    }

    /// Returns `true` for the identity operation.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.rot == [[1, 0, 0], [0, 1, 0], [0, 0, 1]] && self.trans.norm() < SYMM_TOL
    }
}

/// A crystal: primitive lattice, fractional basis per species, and the full
/// space group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Crystal {
    lattice: Matrix3<f64>,
    invlatt: Matrix3<f64>,
    basis: Vec<Vec<Vector3<f64>>>,
    ops: Vec<GroupOp>,
}

fn wrap_frac(v: Vector3<f64>) -> Vector3<f64> {
    v.map(|x| {
        let y = x - x.floor();
        if y > 1.0 - SYMM_TOL {
            0.0
        } else {
            y
        }
    })
}

fn near_integer(v: Vector3<f64>) -> bool {
    v.iter().all(|x| (x - x.round()).abs() < 1e-6)
}

fn int_det(m: &[[i64; 3]; 3]) -> i64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

impl Crystal {
    /// Builds a crystal from a lattice (columns are the primitive vectors)
    /// and a fractional basis per chemical species, generating the full space
    /// group along the way.
    ///
    /// The cell must be primitive; a non-primitive cell would admit pure
    /// translations that this generator does not model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::General`] if the lattice is singular, the basis is
    /// empty, or the symmetry search fails to close into a group.
    pub fn new(lattice: Matrix3<f64>, basis: Vec<Vec<Vector3<f64>>>) -> Result<Self> {
        if basis.iter().all(Vec::is_empty) {
            return Err(Error::General("crystal basis must not be empty".to_owned()));
        }
        let invlatt = lattice
            .try_inverse()
            .ok_or_else(|| Error::General("lattice matrix is singular".to_owned()))?;
        let basis: Vec<Vec<Vector3<f64>>> = basis
            .into_iter()
            .map(|sites| sites.into_iter().map(wrap_frac).collect())
            .collect();
        let ops = generate_ops(&lattice, &invlatt, &basis)?;
        Ok(Self {
            lattice,
            invlatt,
            basis,
            ops,
        })
    }

    /// Face-centered cubic crystal with cubic lattice constant `a` and a
    /// single atom in the primitive cell.
    ///
    /// # Errors
    ///
    /// Propagates the [`Self::new`] errors.
    pub fn fcc(a: f64) -> Result<Self> {
        let lattice = Matrix3::from_columns(&[
            Vector3::new(0.0, 0.5 * a, 0.5 * a),
            Vector3::new(0.5 * a, 0.0, 0.5 * a),
            Vector3::new(0.5 * a, 0.5 * a, 0.0),
        ]);
        Self::new(lattice, vec![vec![Vector3::zeros()]])
    }

    /// Body-centered cubic crystal with cubic lattice constant `a`.
    ///
    /// # Errors
    ///
    /// Propagates the [`Self::new`] errors.
    pub fn bcc(a: f64) -> Result<Self> {
        let lattice = Matrix3::from_columns(&[
            Vector3::new(-0.5 * a, 0.5 * a, 0.5 * a),
            Vector3::new(0.5 * a, -0.5 * a, 0.5 * a),
            Vector3::new(0.5 * a, 0.5 * a, -0.5 * a),
        ]);
        Self::new(lattice, vec![vec![Vector3::zeros()]])
    }

    /// Hexagonal close-packed crystal with basal lattice constant `a` and
    /// axial ratio `c_over_a` (ideal: `sqrt(8/3)`).
    ///
    /// # Errors
    ///
    /// Propagates the [`Self::new`] errors.
    pub fn hcp(a: f64, c_over_a: f64) -> Result<Self> {
        let c = a * c_over_a;
        let half_sqrt3 = 0.5 * 3.0_f64.sqrt();
        let lattice = Matrix3::from_columns(&[
            Vector3::new(0.5 * a, -half_sqrt3 * a, 0.0),
            Vector3::new(0.5 * a, half_sqrt3 * a, 0.0),
            Vector3::new(0.0, 0.0, c),
        ]);
        let basis = vec![vec![
            Vector3::new(1.0 / 3.0, 2.0 / 3.0, 0.25),
            Vector3::new(2.0 / 3.0, 1.0 / 3.0, 0.75),
        ]];
        Self::new(lattice, basis)
    }

    /// Cartesian lattice matrix; columns are the primitive vectors.
    #[must_use]
    pub const fn lattice(&self) -> &Matrix3<f64> {
        &self.lattice
    }

    /// Inverse of the lattice matrix (Cartesian to fractional).
    #[must_use]
    pub const fn invlatt(&self) -> &Matrix3<f64> {
        &self.invlatt
    }

    /// Fractional basis coordinates, grouped by chemical species.
    #[must_use]
    pub fn basis(&self) -> &[Vec<Vector3<f64>>] {
        &self.basis
    }

    /// All space-group operations.
    #[must_use]
    pub fn group(&self) -> &[GroupOp] {
        &self.ops
    }

    /// Number of basis sites of species `chem`.
    #[must_use]
    pub fn num_sites(&self, chem: usize) -> usize {
        self.basis[chem].len()
    }

    /// Unit-cell volume.
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.lattice.determinant().abs()
    }

    /// Reciprocal lattice matrix `2π·(L⁻¹)ᵀ`; columns are the reciprocal
    /// primitive vectors.
    #[must_use]
    pub fn reciprocal_lattice(&self) -> Matrix3<f64> {
        self.invlatt.transpose() * (2.0 * std::f64::consts::PI)
    }

    /// Cartesian position of basis site `(chem, i)` in the origin cell.
    #[must_use]
    pub fn pos_cart(&self, chem: usize, i: usize) -> Vector3<f64> {
        self.lattice * self.basis[chem][i]
    }

    /// Applies `g` to the site `(chem, i)` living in cell `r`; returns the
    /// image cell and site.
    #[must_use]
    pub fn g_pos(&self, g: &GroupOp, r: [i64; 3], site: (usize, usize)) -> ([i64; 3], (usize, usize)) {
        let (chem, i) = site;
        let inew = g.indexmap[chem][i];
        #[allow(clippy::cast_precision_loss)]
        let rvec = Vector3::new(r[0] as f64, r[1] as f64, r[2] as f64);
        let u = g.rot_f64() * (self.basis[chem][i] + rvec) + g.trans;
        let du = u - self.basis[chem][inew];
        debug_assert!(near_integer(du), "group operation maps off-lattice");
        #[allow(clippy::cast_possible_truncation)]
        let rnew = [
            du[0].round() as i64,
            du[1].round() as i64,
            du[2].round() as i64,
        ];
        (rnew, (chem, inew))
    }

    /// Applies `g` to a Cartesian direction.
    #[must_use]
    pub fn g_direc(g: &GroupOp, v: &Vector3<f64>) -> Vector3<f64> {
        g.cartrot * v
    }

    /// Applies `g` to a Cartesian rank-2 tensor.
    #[must_use]
    pub fn g_tensor(g: &GroupOp, t: &Matrix3<f64>) -> Matrix3<f64> {
        g.cartrot * t * g.cartrot.transpose()
    }

    /// Groups the sites of species `chem` into Wyckoff-equivalent orbits.
    #[must_use]
    pub fn sitelist(&self, chem: usize) -> Vec<Vec<usize>> {
        let n = self.basis[chem].len();
        let mut seen = vec![false; n];
        let mut lists = Vec::new();
        for i in 0..n {
            if seen[i] {
                continue;
            }
            let mut orbit: Vec<usize> = self
                .ops
                .iter()
                .map(|g| g.indexmap[chem][i])
                .collect::<FxHashSet<_>>()
                .into_iter()
                .collect();
            orbit.sort_unstable();
            for &j in &orbit {
                seen[j] = true;
            }
            lists.push(orbit);
        }
        lists
    }

    /// Enumerates the symmetry-unique jumps of species `chem` up to `cutoff`
    /// (Cartesian distance). Each inner list is one orbit of
    /// `((i, j), dx)` entries and contains both jump directions.
    #[must_use]
    pub fn jumpnetwork(&self, chem: usize, cutoff: f64) -> Vec<Vec<((usize, usize), Vector3<f64>)>> {
        let nsite = self.basis[chem].len();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bound: Vec<i64> = (0..3)
            .map(|row| (cutoff * self.invlatt.row(row).norm()).ceil() as i64 + 1)
            .collect();

        // all candidate jumps, keyed by (i, j, R)
        let mut all: Vec<(usize, usize, [i64; 3])> = Vec::new();
        for (i, j) in iproduct!(0..nsite, 0..nsite) {
            for (r0, r1, r2) in iproduct!(
                -bound[0]..=bound[0],
                -bound[1]..=bound[1],
                -bound[2]..=bound[2]
            ) {
                let r = [r0, r1, r2];
                if i == j && r == [0, 0, 0] {
                    continue;
                }
                let dx = self.jump_dx(chem, i, j, r);
                let len = dx.norm();
                if len > SYMM_TOL && len <= cutoff {
                    all.push((i, j, r));
                }
            }
        }
        all.sort_unstable_by(|a, b| {
            let da = self.jump_dx(chem, a.0, a.1, a.2).norm_squared();
            let db = self.jump_dx(chem, b.0, b.1, b.2).norm_squared();
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)))
        });

        let mut visited: FxHashSet<(usize, usize, [i64; 3])> = FxHashSet::default();
        let mut network = Vec::new();
        for &(i, j, r) in &all {
            if visited.contains(&(i, j, r)) {
                continue;
            }
            let mut orbit: FxHashSet<(usize, usize, [i64; 3])> = FxHashSet::default();
            for g in &self.ops {
                let (ri, (_, gi)) = self.g_pos(g, [0, 0, 0], (chem, i));
                let (rj, (_, gj)) = self.g_pos(g, r, (chem, j));
                let rn = [rj[0] - ri[0], rj[1] - ri[1], rj[2] - ri[2]];
                orbit.insert((gi, gj, rn));
                orbit.insert((gj, gi, [-rn[0], -rn[1], -rn[2]]));
            }
            let mut members: Vec<_> = orbit.into_iter().collect();
            members.sort_unstable();
            let jumps = members
                .iter()
                .map(|&(a, b, rr)| ((a, b), self.jump_dx(chem, a, b, rr)))
                .collect();
            visited.extend(members);
            network.push(jumps);
        }
        network
    }

    fn jump_dx(&self, chem: usize, i: usize, j: usize, r: [i64; 3]) -> Vector3<f64> {
        #[allow(clippy::cast_precision_loss)]
        let rvec = Vector3::new(r[0] as f64, r[1] as f64, r[2] as f64);
        self.lattice * (rvec + self.basis[chem][j] - self.basis[chem][i])
    }

    /// Cartesian rotations of the operations that map site `(chem, i)` onto
    /// itself (modulo lattice translations).
    #[must_use]
    pub fn site_stabilizer(&self, chem: usize, i: usize) -> Vec<Matrix3<f64>> {
        self.ops
            .iter()
            .filter(|g| g.indexmap[chem][i] == i)
            .map(|g| g.cartrot)
            .collect()
    }

    /// Symmetry-adapted vector basis at site `(chem, i)`: the dimension of
    /// the invariant vector space together with its characteristic direction
    /// (the invariant direction for dimension 1, the plane normal for
    /// dimension 2, zero otherwise).
    #[must_use]
    pub fn vector_basis(&self, site: (usize, usize)) -> (usize, Vector3<f64>) {
        let stab = self.site_stabilizer(site.0, site.1);
        #[allow(clippy::cast_precision_loss)]
        let proj = stab.iter().copied().sum::<Matrix3<f64>>() / stab.len() as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let dim = proj.trace().round().max(0.0) as usize;
        let direction = match dim {
            1 => largest_column(&proj),
            2 => largest_column(&(Matrix3::identity() - proj)),
            _ => Vector3::zeros(),
        };
        (dim, direction)
    }

    /// Expands a [`Self::vector_basis`] result into a list of orthonormal
    /// vectors spanning the invariant space.
    #[must_use]
    pub fn vect_list((dim, v): (usize, Vector3<f64>)) -> Vec<Vector3<f64>> {
        match dim {
            1 => vec![v],
            2 => {
                // two orthonormal vectors perpendicular to the plane normal v
                let v1 = if v[2].abs() < 0.75 {
                    Vector3::new(v[1], -v[0], 0.0)
                } else {
                    Vector3::new(-v[2], 0.0, v[0])
                }
                .normalize();
                let v2 = v.cross(&v1);
                vec![v1, v2]
            }
            3 => vec![Vector3::x(), Vector3::y(), Vector3::z()],
            _ => Vec::new(),
        }
    }

    /// Orthonormal basis (Frobenius inner product) of the symmetric tensors
    /// invariant under the site group of `(chem, i)`.
    #[must_use]
    pub fn symm_tensor_basis(&self, site: (usize, usize)) -> Vec<Matrix3<f64>> {
        projected_tensor_basis(&self.site_stabilizer(site.0, site.1))
    }
}

fn largest_column(m: &Matrix3<f64>) -> Vector3<f64> {
    let mut best = Vector3::zeros();
    for c in 0..3 {
        let col: Vector3<f64> = m.column(c).clone_owned();
        if col.norm() > best.norm() {
            best = col;
        }
    }
    if best.norm() > SYMM_TOL {
        best.normalize()
    } else {
        Vector3::zeros()
    }
}

/// Orthonormal basis of the symmetric rank-2 tensors invariant under all of
/// `cartrots`, obtained by group-averaging the canonical symmetric basis and
/// Gram-Schmidt reduction.
#[must_use]
pub fn projected_tensor_basis(cartrots: &[Matrix3<f64>]) -> Vec<Matrix3<f64>> {
    let s = std::f64::consts::FRAC_1_SQRT_2;
    let canonical = [
        Matrix3::from_diagonal(&Vector3::new(1.0, 0.0, 0.0)),
        Matrix3::from_diagonal(&Vector3::new(0.0, 1.0, 0.0)),
        Matrix3::from_diagonal(&Vector3::new(0.0, 0.0, 1.0)),
        Matrix3::new(0.0, s, 0.0, s, 0.0, 0.0, 0.0, 0.0, 0.0),
        Matrix3::new(0.0, 0.0, s, 0.0, 0.0, 0.0, s, 0.0, 0.0),
        Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, s, 0.0, s, 0.0),
    ];
    let mut basis: Vec<Matrix3<f64>> = Vec::new();
    for e in &canonical {
        #[allow(clippy::cast_precision_loss)]
        let mut avg = cartrots
            .iter()
            .map(|g| g * e * g.transpose())
            .sum::<Matrix3<f64>>()
            / cartrots.len() as f64;
        avg = 0.5 * (avg + avg.transpose());
        for b in &basis {
            let overlap = avg.dot(b);
            avg -= b * overlap;
        }
        let norm = avg.norm();
        if norm > 1e-6 {
            basis.push(avg / norm);
        }
    }
    basis
}

/// Projects `t` onto the span of an orthonormal tensor `basis`.
#[must_use]
pub fn project_tensor(t: &Matrix3<f64>, basis: &[Matrix3<f64>]) -> Matrix3<f64> {
    basis.iter().map(|b| b * t.dot(b)).sum()
}

fn generate_ops(
    lattice: &Matrix3<f64>,
    invlatt: &Matrix3<f64>,
    basis: &[Vec<Vector3<f64>>],
) -> Result<Vec<GroupOp>> {
    let metric = lattice.transpose() * lattice;
    let tol = 1e-6 * metric.trace();

    // integer column candidates preserving each diagonal metric entry
    let mut candidates: [Vec<Vector3<i64>>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (c, cand) in candidates.iter_mut().enumerate() {
        for (x, y, z) in iproduct!(-2_i64..=2, -2_i64..=2, -2_i64..=2) {
            #[allow(clippy::cast_precision_loss)]
            let v = Vector3::new(x as f64, y as f64, z as f64);
            if (v.dot(&(metric * v)) - metric[(c, c)]).abs() < tol {
                cand.push(Vector3::new(x, y, z));
            }
        }
    }

    let cross = |a: &Vector3<i64>, b: &Vector3<i64>, (ra, rb): (usize, usize)| -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let (af, bf) = (a.map(|x| x as f64), b.map(|x| x as f64));
        af.dot(&(metric * bf)) - metric[(ra, rb)]
    };

    let mut rotations: Vec<[[i64; 3]; 3]> = Vec::new();
    for c0 in &candidates[0] {
        for c1 in &candidates[1] {
            if cross(c0, c1, (0, 1)).abs() >= tol {
                continue;
            }
            for c2 in &candidates[2] {
                if cross(c0, c2, (0, 2)).abs() >= tol || cross(c1, c2, (1, 2)).abs() >= tol {
                    continue;
                }
                // columns of the fractional rotation matrix
                let m = [
                    [c0[0], c1[0], c2[0]],
                    [c0[1], c1[1], c2[1]],
                    [c0[2], c1[2], c2[2]],
                ];
                if int_det(&m).abs() == 1 {
                    rotations.push(m);
                }
            }
        }
    }

    // anchor species: fewest sites, for the translation search
    let anchor = (0..basis.len())
        .filter(|&c| !basis[c].is_empty())
        .min_by_key(|&c| basis[c].len())
        .ok_or_else(|| Error::General("crystal basis must not be empty".to_owned()))?;

    let mut ops: Vec<GroupOp> = Vec::new();
    let mut seen: FxHashSet<([[i64; 3]; 3], [i64; 3])> = FxHashSet::default();
    for rot in rotations {
        #[allow(clippy::cast_precision_loss)]
        let rot_f = Matrix3::new(
            rot[0][0] as f64,
            rot[0][1] as f64,
            rot[0][2] as f64,
            rot[1][0] as f64,
            rot[1][1] as f64,
            rot[1][2] as f64,
            rot[2][0] as f64,
            rot[2][1] as f64,
            rot[2][2] as f64,
        );
        for target in 0..basis[anchor].len() {
            let trans = wrap_frac(basis[anchor][target] - rot_f * basis[anchor][0]);
            let Some(indexmap) = build_indexmap(&rot_f, &trans, basis) else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)]
            let key = (
                rot,
                [
                    (trans[0] * 1e6).round() as i64,
                    (trans[1] * 1e6).round() as i64,
                    (trans[2] * 1e6).round() as i64,
                ],
            );
            if seen.insert(key) {
                ops.push(GroupOp {
                    rot,
                    cartrot: lattice * rot_f * invlatt,
                    trans,
                    indexmap,
                });
            }
        }
    }

    if !ops.iter().any(GroupOp::is_identity) {
        return Err(Error::General(
            "symmetry search failed to produce the identity operation".to_owned(),
        ));
    }
    Ok(ops)
}

fn build_indexmap(
    rot_f: &Matrix3<f64>,
    trans: &Vector3<f64>,
    basis: &[Vec<Vector3<f64>>],
) -> Option<Vec<Vec<usize>>> {
    let mut indexmap = Vec::with_capacity(basis.len());
    for sites in basis {
        let mut map = Vec::with_capacity(sites.len());
        let mut hit = vec![false; sites.len()];
        for b in sites {
            let u = rot_f * b + trans;
            let j = sites
                .iter()
                .position(|bj| near_integer(&u - bj))?;
            if hit[j] {
                return None; // not a bijection
            }
            hit[j] = true;
            map.push(j);
        }
        indexmap.push(map);
    }
    Some(indexmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn fcc_group_order() {
        let crys = Crystal::fcc(1.0).unwrap();
        assert_eq!(crys.group().len(), 48);
        assert_eq!(crys.sitelist(0), vec![vec![0]]);
        // all operations are orthogonal in Cartesian form
        for g in crys.group() {
            let gtg = g.cartrot.transpose() * g.cartrot;
            assert!((gtg - Matrix3::identity()).norm() < 1e-10);
        }
    }

    #[test]
    fn bcc_group_order() {
        let crys = Crystal::bcc(1.0).unwrap();
        assert_eq!(crys.group().len(), 48);
    }

    #[test]
    fn hcp_group_order() {
        let crys = Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap();
        assert_eq!(crys.group().len(), 24);
        // one Wyckoff orbit containing both basis sites
        assert_eq!(crys.sitelist(0), vec![vec![0, 1]]);
    }

    #[test]
    fn fcc_nearest_neighbor_network() {
        let crys = Crystal::fcc(1.0).unwrap();
        let jn = crys.jumpnetwork(0, 0.75);
        assert_eq!(jn.len(), 1);
        assert_eq!(jn[0].len(), 12);
        for &((i, j), dx) in &jn[0] {
            assert_eq!((i, j), (0, 0));
            assert_approx_eq!(f64, dx.norm(), 0.5_f64.sqrt(), epsilon = 1e-12);
        }
    }

    #[test]
    fn bcc_nearest_neighbor_network() {
        let crys = Crystal::bcc(1.0).unwrap();
        let jn = crys.jumpnetwork(0, 0.9);
        assert_eq!(jn.len(), 1);
        assert_eq!(jn[0].len(), 8);
        for &(_, dx) in &jn[0] {
            assert_approx_eq!(f64, dx.norm(), 0.75_f64.sqrt(), epsilon = 1e-12);
        }
    }

    #[test]
    fn hcp_nearest_neighbor_network() {
        let crys = Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap();
        let jn = crys.jumpnetwork(0, 1.01);
        // basal and pyramidal families at the ideal axial ratio
        assert_eq!(jn.len(), 2);
        let mut sizes: Vec<usize> = jn.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![12, 12]);
        let basal = jn
            .iter()
            .find(|orbit| orbit.iter().all(|&(_, dx)| dx[2].abs() < 1e-9))
            .expect("one orbit stays in the basal plane");
        assert!(basal.iter().all(|&((i, j), _)| i == j));
    }

    #[test]
    fn cubic_site_has_no_vector_basis() {
        let crys = Crystal::fcc(1.0).unwrap();
        let (dim, _) = crys.vector_basis((0, 0));
        assert_eq!(dim, 0);
        // cubic site symmetry leaves only the isotropic tensor
        let tb = crys.symm_tensor_basis((0, 0));
        assert_eq!(tb.len(), 1);
        assert!((tb[0] - Matrix3::identity() / 3.0_f64.sqrt()).norm() < 1e-10);
    }

    #[test]
    fn hcp_site_tensor_basis_is_axial() {
        let crys = Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap();
        let (dim, _) = crys.vector_basis((0, 0));
        assert_eq!(dim, 0);
        // basal-isotropic plus axial component
        assert_eq!(crys.symm_tensor_basis((0, 0)).len(), 2);
    }

    #[test]
    fn group_closure_on_positions() {
        let crys = Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap();
        for g in crys.group() {
            for i in 0..crys.num_sites(0) {
                let (r, (_, j)) = crys.g_pos(g, [0, 0, 0], (0, i));
                #[allow(clippy::cast_precision_loss)]
                let rvec = Vector3::new(r[0] as f64, r[1] as f64, r[2] as f64);
                let lhs = g.cartrot * crys.pos_cart(0, i)
                    + crys.lattice() * g.trans;
                let rhs = crys.lattice() * rvec + crys.pos_cart(0, j);
                assert!((lhs - rhs).norm() < 1e-9);
            }
        }
    }
}
