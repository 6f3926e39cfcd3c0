//! Interstitial diffusion: diffusivity, its β-derivative, and the
//! elastodiffusion tensor for a single mobile species hopping on its own
//! site list.
//!
//! The crystal does most of the symmetry work; what remains is the
//! symmetry-adapted vector basis over the unit cell, the projected rate/bias
//! solve, and the dipole bookkeeping for elastodiffusion.

use crate::crystal::{project_tensor, projected_tensor_basis, Crystal, GroupOp};
use crate::error::{Error, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Matrix3, Vector3};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn check_len(name: &'static str, found: usize, expected: usize) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            name,
            expected,
            found,
        })
    }
}

/// Interstitial diffusivity calculator for one chemical species.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Interstitial {
    crystal: Arc<Crystal>,
    chem: usize,
    sitelist: Vec<Vec<usize>>,
    invmap: Vec<usize>,
    jumpnetwork: Vec<Vec<((usize, usize), Vector3<f64>)>>,
    nsites: usize,
    /// Unit-cell vector-basis fields, each of shape `(nsites, 3)`.
    vector_basis: Vec<Array2<f64>>,
    /// `vv[a, b, α, β] = Σ_n basis_α[n, a]·basis_β[n, b]`.
    vv: Array4<f64>,
    omega_invertible: bool,
    site_group_ops: Vec<Vec<usize>>,
    jump_group_ops: Vec<Vec<usize>>,
    site_tensor_basis: Vec<Vec<Matrix3<f64>>>,
    jump_tensor_basis: Vec<Vec<Matrix3<f64>>>,
}

impl Interstitial {
    /// Creates a calculator for species `chem` with the given Wyckoff site
    /// list and jump network (both as produced by [`Crystal`]).
    #[must_use]
    pub fn new(
        crystal: Arc<Crystal>,
        chem: usize,
        sitelist: Vec<Vec<usize>>,
        jumpnetwork: Vec<Vec<((usize, usize), Vector3<f64>)>>,
    ) -> Self {
        let nsites = sitelist.iter().map(Vec::len).sum();
        let mut invmap = vec![0; nsites];
        for (w, sites) in sitelist.iter().enumerate() {
            for &i in sites {
                invmap[i] = w;
            }
        }
        let (vector_basis, vv) = generate_vector_basis(&crystal, chem, &sitelist, nsites);
        let omega_invertible = vector_basis.is_empty()
            || crystal
                .group()
                .iter()
                .any(|g| (g.cartrot + Matrix3::identity()).norm() < 1e-8);
        let site_group_ops = generate_site_group_ops(&crystal, chem, &sitelist);
        let jump_group_ops = generate_jump_group_ops(&crystal, chem, &jumpnetwork);
        let site_tensor_basis = sitelist
            .iter()
            .map(|sites| crystal.symm_tensor_basis((chem, sites[0])))
            .collect();
        let jump_tensor_basis = jumpnetwork
            .iter()
            .map(|orbit| {
                let stab = jump_stabilizer(&crystal, chem, orbit[0]);
                projected_tensor_basis(&stab)
            })
            .collect();
        Self {
            crystal,
            chem,
            sitelist,
            invmap,
            jumpnetwork,
            nsites,
            vector_basis,
            vv,
            omega_invertible,
            site_group_ops,
            jump_group_ops,
            site_tensor_basis,
            jump_tensor_basis,
        }
    }

    /// The Wyckoff site list this calculator runs on.
    #[must_use]
    pub fn sitelist(&self) -> &[Vec<usize>] {
        &self.sitelist
    }

    /// The jump network this calculator runs on.
    #[must_use]
    pub fn jumpnetwork(&self) -> &[Vec<((usize, usize), Vector3<f64>)>] {
        &self.jumpnetwork
    }

    /// Normalized site probabilities from per-Wyckoff prefactors/energies.
    #[must_use]
    pub fn siteprob(&self, pre: &[f64], betaene: &[f64]) -> Vec<f64> {
        let minbe = betaene.iter().copied().fold(f64::INFINITY, f64::min);
        let rho: Vec<f64> = self
            .invmap
            .iter()
            .map(|&w| pre[w] * (minbe - betaene[w]).exp())
            .collect();
        let total: f64 = rho.iter().sum();
        rho.into_iter().map(|x| x / total).collect()
    }

    /// Per-jump rates, matched to the jump network structure.
    #[must_use]
    pub fn ratelist(
        &self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Vec<Vec<f64>> {
        self.jumpnetwork
            .iter()
            .zip(pre_t.iter().zip(betaene_t))
            .map(|(orbit, (&pt, &bet))| {
                orbit
                    .iter()
                    .map(|&((i, _), _)| {
                        let w = self.invmap[i];
                        pt * (betaene[w] - bet).exp() / pre[w]
                    })
                    .collect()
            })
            .collect()
    }

    /// Per-jump symmetrized rates, matched to the jump network structure.
    #[must_use]
    pub fn symmratelist(
        &self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Vec<Vec<f64>> {
        self.jumpnetwork
            .iter()
            .zip(pre_t.iter().zip(betaene_t))
            .map(|(orbit, (&pt, &bet))| {
                orbit
                    .iter()
                    .map(|&((i, j), _)| {
                        let (wi, wj) = (self.invmap[i], self.invmap[j]);
                        pt * (0.5 * (betaene[wi] + betaene[wj]) - bet).exp()
                            / (pre[wi] * pre[wj]).sqrt()
                    })
                    .collect()
            })
            .collect()
    }

    fn check_inputs(
        &self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Result<()> {
        check_len("pre", pre.len(), self.sitelist.len())?;
        check_len("betaene", betaene.len(), self.sitelist.len())?;
        check_len("pre_t", pre_t.len(), self.jumpnetwork.len())?;
        check_len("betaene_t", betaene_t.len(), self.jumpnetwork.len())
    }

    /// Diffusivity tensor for the given per-Wyckoff site and per-jump-type
    /// transition prefactors and scaled energies.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when an input length disagrees with the site
    /// list or jump network.
    pub fn diffusivity(
        &self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Result<Matrix3<f64>> {
        self.diffusivity_impl(pre, betaene, pre_t, betaene_t)
            .map(|(d0, _)| d0)
    }

    /// Diffusivity together with its negative β-derivative (the
    /// diffusivity-weighted activation barrier tensor).
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when an input length disagrees with the site
    /// list or jump network.
    pub fn diffusivity_deriv(
        &self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Result<(Matrix3<f64>, Matrix3<f64>)> {
        self.diffusivity_impl(pre, betaene, pre_t, betaene_t)
    }

    #[allow(clippy::similar_names)]
    fn diffusivity_impl(
        &self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Result<(Matrix3<f64>, Matrix3<f64>)> {
        self.check_inputs(pre, betaene, pre_t, betaene_t)?;
        let rho = self.siteprob(pre, betaene);
        let sqrtrho: Vec<f64> = rho.iter().map(|&x| x.sqrt()).collect();
        let rates = self.ratelist(pre, betaene, pre_t, betaene_t);
        let symmrates = self.symmratelist(pre, betaene, pre_t, betaene_t);
        let siteene: Vec<f64> = self.invmap.iter().map(|&w| betaene[w]).collect();
        let eave: f64 = rho.iter().zip(&siteene).map(|(&r, &e)| r * e).sum();

        let n = self.nsites;
        let mut omega = DMatrix::<f64>::zeros(n, n);
        let mut domega = DMatrix::<f64>::zeros(n, n);
        let mut bias = vec![Vector3::<f64>::zeros(); n];
        let mut dbias = vec![Vector3::<f64>::zeros(); n];
        let mut d0 = Matrix3::<f64>::zeros();
        let mut db = Matrix3::<f64>::zeros();
        for ((orbit, rlist), (slist, &bet)) in self
            .jumpnetwork
            .iter()
            .zip(&rates)
            .zip(symmrates.iter().zip(betaene_t))
        {
            for ((&((i, j), dx), &rate), &symmrate) in orbit.iter().zip(rlist).zip(slist) {
                omega[(i, j)] += symmrate;
                omega[(i, i)] -= rate;
                domega[(i, j)] += symmrate * (bet - 0.5 * (siteene[i] + siteene[j]));
                domega[(i, i)] -= rate * (bet - siteene[i]);
                bias[i] += sqrtrho[i] * rate * dx;
                dbias[i] += sqrtrho[i] * rate * dx * (bet - 0.5 * (siteene[i] + eave));
                let outer = dx * dx.transpose();
                d0 += 0.5 * outer * rho[i] * rate;
                db += 0.5 * outer * rho[i] * rate * (bet - eave);
            }
        }

        let nv = self.vector_basis.len();
        if nv > 0 {
            let mut omega_v = DMatrix::<f64>::zeros(nv, nv);
            let mut domega_v = DMatrix::<f64>::zeros(nv, nv);
            let mut bias_v = DVector::<f64>::zeros(nv);
            let mut dbias_v = DVector::<f64>::zeros(nv);
            for (a, va) in self.vector_basis.iter().enumerate() {
                bias_v[a] = field_dot(va, &bias);
                dbias_v[a] = field_dot(va, &dbias);
                for (b, vb) in self.vector_basis.iter().enumerate() {
                    omega_v[(a, b)] = project_matrix(va, &omega, vb);
                    domega_v[(a, b)] = project_matrix(va, &domega, vb);
                }
            }
            let gamma_v = self.bias_solve(&omega_v, &bias_v);
            let dgamma_v = &domega_v * &gamma_v;
            d0 += self.vv_contract(&bias_v, &gamma_v);
            db += self.vv_contract(&dbias_v, &gamma_v) + self.vv_contract(&gamma_v, &dbias_v)
                - self.vv_contract(&gamma_v, &dgamma_v);
        }
        Ok((d0, db))
    }

    /// `Σ_{α,β} vv[·,·,α,β]·x[α]·y[β]`.
    fn vv_contract(&self, x: &DVector<f64>, y: &DVector<f64>) -> Matrix3<f64> {
        let nv = x.len();
        let mut out = Matrix3::zeros();
        for a in 0..3 {
            for b in 0..3 {
                for i in 0..nv {
                    for j in 0..nv {
                        out[(a, b)] += self.vv[[a, b, i, j]] * x[i] * y[j];
                    }
                }
            }
        }
        out
    }

    /// Solves `ω·γ = b` for the projected rate matrix, which is negative
    /// definite when the group contains inversion and only semidefinite
    /// otherwise.
    fn bias_solve(&self, omega: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
        if self.omega_invertible {
            if let Some(chol) = Cholesky::new(-omega.clone()) {
                return -chol.solve(b);
            }
        }
        let svd = omega.clone().svd(true, true);
        svd.pseudo_inverse(1e-12)
            // UNWRAP: svd was computed with both sets of singular vectors
            .unwrap_or_else(|_| unreachable!())
            * b
    }

    /// Elastic dipole for every site, expanded from the Wyckoff
    /// representatives after projection onto the site-symmetric basis.
    #[must_use]
    pub fn site_dipoles(&self, dipoles: &[Matrix3<f64>]) -> Vec<Matrix3<f64>> {
        let mut out = vec![Matrix3::zeros(); self.nsites];
        for (((dipole, basis), sites), ops) in dipoles
            .iter()
            .zip(&self.site_tensor_basis)
            .zip(&self.sitelist)
            .zip(&self.site_group_ops)
        {
            let symm = project_tensor(dipole, basis);
            for (&i, &gi) in sites.iter().zip(ops) {
                out[i] = Crystal::g_tensor(&self.crystal.group()[gi], &symm);
            }
        }
        out
    }

    /// Elastic dipole for every transition, expanded from the jump-network
    /// representatives after projection onto the jump-symmetric basis.
    #[must_use]
    pub fn jump_dipoles(&self, dipoles: &[Matrix3<f64>]) -> Vec<Vec<Matrix3<f64>>> {
        dipoles
            .iter()
            .zip(&self.jump_tensor_basis)
            .zip(&self.jump_group_ops)
            .map(|((dipole, basis), ops)| {
                let symm = project_tensor(dipole, basis);
                ops.iter()
                    .map(|&gi| Crystal::g_tensor(&self.crystal.group()[gi], &symm))
                    .collect()
            })
            .collect()
    }

    /// Elastodiffusion tensor: the diffusivity and its derivative with
    /// respect to strain, from site and transition elastic dipoles (all
    /// divided by kT).
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when an input length disagrees with the site
    /// list or jump network.
    #[allow(clippy::too_many_arguments, clippy::similar_names)]
    pub fn elastodiffusion(
        &self,
        pre: &[f64],
        betaene: &[f64],
        dipole: &[Matrix3<f64>],
        pre_t: &[f64],
        betaene_t: &[f64],
        dipole_t: &[Matrix3<f64>],
    ) -> Result<(Matrix3<f64>, Array4<f64>)> {
        self.check_inputs(pre, betaene, pre_t, betaene_t)?;
        check_len("dipole", dipole.len(), self.sitelist.len())?;
        check_len("dipole_t", dipole_t.len(), self.jumpnetwork.len())?;
        let rho = self.siteprob(pre, betaene);
        let sqrtrho: Vec<f64> = rho.iter().map(|&x| x.sqrt()).collect();
        let rates = self.ratelist(pre, betaene, pre_t, betaene_t);
        let symmrates = self.symmratelist(pre, betaene, pre_t, betaene_t);
        let sitedipoles = self.site_dipoles(dipole);
        let jumpdipoles = self.jump_dipoles(dipole_t);
        let dipole_ave: Matrix3<f64> = rho
            .iter()
            .zip(&sitedipoles)
            .map(|(&r, d)| d * r)
            .sum();

        let n = self.nsites;
        let mut omega = DMatrix::<f64>::zeros(n, n);
        let mut domega = vec![vec![Matrix3::<f64>::zeros(); n]; n];
        let mut bias = vec![Vector3::<f64>::zeros(); n];
        // biasp[i][a] is the 3x3 tensor paired with the a-th bias component
        let mut biasp = vec![[Matrix3::<f64>::zeros(); 3]; n];
        let mut d0 = Matrix3::<f64>::zeros();
        let mut dp = Array4::<f64>::zeros((3, 3, 3, 3));

        for ((orbit, rlist), (slist, dlist)) in self
            .jumpnetwork
            .iter()
            .zip(&rates)
            .zip(symmrates.iter().zip(&jumpdipoles))
        {
            for (((&((i, j), dx), &rate), &symmrate), dip) in
                orbit.iter().zip(rlist).zip(slist).zip(dlist)
            {
                omega[(i, j)] += symmrate;
                omega[(i, i)] -= rate;
                domega[i][j] -= (dip - 0.5 * (sitedipoles[i] + sitedipoles[j])) * symmrate;
                domega[i][i] += (dip - sitedipoles[i]) * rate;
                bias[i] += sqrtrho[i] * rate * dx;
                let ptensor = dip - 0.5 * (sitedipoles[i] + dipole_ave);
                for a in 0..3 {
                    biasp[i][a] += sqrtrho[i] * rate * dx[a] * ptensor;
                }
                let outer = dx * dx.transpose() * (rho[i] * rate);
                d0 += 0.5 * outer;
                let pdiff = dip - dipole_ave;
                for (a, b, c, d) in
                    itertools::iproduct!(0..3, 0..3, 0..3, 0..3)
                {
                    dp[[a, b, c, d]] += 0.5 * outer[(a, b)] * pdiff[(c, d)];
                }
            }
        }

        let nv = self.vector_basis.len();
        if nv > 0 {
            let mut omega_v = DMatrix::<f64>::zeros(nv, nv);
            let mut bias_v = DVector::<f64>::zeros(nv);
            let mut domega_v = vec![vec![Matrix3::<f64>::zeros(); nv]; nv];
            for (a, va) in self.vector_basis.iter().enumerate() {
                bias_v[a] = field_dot(va, &bias);
                for (b, vb) in self.vector_basis.iter().enumerate() {
                    omega_v[(a, b)] = project_matrix(va, &omega, vb);
                    let mut acc = Matrix3::zeros();
                    for ni in 0..n {
                        for nj in 0..n {
                            let coeff: f64 = (0..3).map(|e| va[[ni, e]] * vb[[nj, e]]).sum();
                            acc += domega[ni][nj] * coeff;
                        }
                    }
                    domega_v[a][b] = acc;
                }
            }
            let gamma_v = self.bias_solve(&omega_v, &bias_v);
            // dg[v] = Σ_w domega_v[v][w]·gamma[w]
            let dg: Vec<Matrix3<f64>> = (0..nv)
                .map(|a| {
                    (0..nv)
                        .map(|b| domega_v[a][b] * gamma_v[b])
                        .sum()
                })
                .collect();
            // gamma folded back onto sites
            let mut gamma_i = Array2::<f64>::zeros((n, 3));
            for (g, va) in gamma_v.iter().zip(&self.vector_basis) {
                for ni in 0..n {
                    for e in 0..3 {
                        gamma_i[[ni, e]] += g * va[[ni, e]];
                    }
                }
            }
            d0 += self.vv_contract(&bias_v, &gamma_v);
            for (c, d) in itertools::iproduct!(0..3, 0..3) {
                for (a, b) in itertools::iproduct!(0..3, 0..3) {
                    let mut acc = 0.0;
                    for ni in 0..n {
                        acc += gamma_i[[ni, a]] * biasp[ni][b][(c, d)]
                            + biasp[ni][a][(c, d)] * gamma_i[[ni, b]];
                    }
                    dp[[a, b, c, d]] += acc;
                }
            }
            for (a, b, c, d) in itertools::iproduct!(0..3, 0..3, 0..3, 0..3) {
                let mut acc = 0.0;
                for i in 0..nv {
                    let vvg: f64 = (0..nv).map(|j| self.vv[[a, b, i, j]] * gamma_v[j]).sum();
                    acc += vvg * dg[i][(c, d)];
                }
                dp[[a, b, c, d]] += acc;
            }
        }

        for (a, b, c, d) in itertools::iproduct!(0..3, 0..3, 0..3, 0..3) {
            if a == c {
                dp[[a, b, c, d]] += 0.5 * d0[(b, d)];
            }
            if a == d {
                dp[[a, b, c, d]] += 0.5 * d0[(b, c)];
            }
            if b == c {
                dp[[a, b, c, d]] += 0.5 * d0[(a, d)];
            }
            if b == d {
                dp[[a, b, c, d]] += 0.5 * d0[(a, c)];
            }
        }
        Ok((d0, dp))
    }
}

/// `Σ_n Σ_a field[n, a]·vecs[n][a]`.
fn field_dot(field: &Array2<f64>, vecs: &[Vector3<f64>]) -> f64 {
    vecs.iter()
        .enumerate()
        .map(|(n, v)| (0..3).map(|a| field[[n, a]] * v[a]).sum::<f64>())
        .sum()
}

/// `Σ_{n,m} Σ_a va[n, a]·m[n, m]·vb[m, a]`.
fn project_matrix(va: &Array2<f64>, mat: &DMatrix<f64>, vb: &Array2<f64>) -> f64 {
    let n = mat.nrows();
    let mut acc = 0.0;
    for i in 0..n {
        for j in 0..n {
            let dot: f64 = (0..3).map(|a| va[[i, a]] * vb[[j, a]]).sum();
            acc += dot * mat[(i, j)];
        }
    }
    acc
}

fn generate_vector_basis(
    crystal: &Crystal,
    chem: usize,
    sitelist: &[Vec<usize>],
    nsites: usize,
) -> (Vec<Array2<f64>>, Array4<f64>) {
    let mut fields = Vec::new();
    for sites in sitelist {
        let vb = crystal.vector_basis((chem, sites[0]));
        for v in Crystal::vect_list(vb) {
            #[allow(clippy::cast_precision_loss)]
            let v = v / (sites.len() as f64).sqrt();
            let mut field = Array2::<f64>::zeros((nsites, 3));
            for g in crystal.group() {
                let target = g.indexmap[chem][sites[0]];
                let gv = Crystal::g_direc(g, &v);
                for a in 0..3 {
                    field[[target, a]] = gv[a];
                }
            }
            fields.push(field);
        }
    }
    let nv = fields.len();
    let mut vv = Array4::<f64>::zeros((3, 3, nv, nv));
    for (i, fi) in fields.iter().enumerate() {
        for (j, fj) in fields.iter().enumerate() {
            for a in 0..3 {
                for b in 0..3 {
                    let mut acc = 0.0;
                    for ni in 0..nsites {
                        acc += fi[[ni, a]] * fj[[ni, b]];
                    }
                    vv[[a, b, i, j]] = acc;
                }
            }
        }
    }
    (fields, vv)
}

fn generate_site_group_ops(
    crystal: &Crystal,
    chem: usize,
    sitelist: &[Vec<usize>],
) -> Vec<Vec<usize>> {
    sitelist
        .iter()
        .map(|sites| {
            let i0 = sites[0];
            sites
                .iter()
                .map(|&i| {
                    crystal
                        .group()
                        .iter()
                        .position(|g| g.indexmap[chem][i0] == i)
                        // UNWRAP: the site list was built from the same group
                        .unwrap_or_else(|| unreachable!())
                })
                .collect()
        })
        .collect()
}

fn jump_maps(
    crystal: &Crystal,
    chem: usize,
    g: &GroupOp,
    (i0, j0): (usize, usize),
    dx0: &Vector3<f64>,
    (i, j): (usize, usize),
    dx: &Vector3<f64>,
) -> bool {
    let gdx = Crystal::g_direc(g, dx0);
    (g.indexmap[chem][i0] == i && g.indexmap[chem][j0] == j && (gdx - dx).norm() < 1e-8)
        || (g.indexmap[chem][i0] == j && g.indexmap[chem][j0] == i && (gdx + dx).norm() < 1e-8)
}

fn generate_jump_group_ops(
    crystal: &Crystal,
    chem: usize,
    jumpnetwork: &[Vec<((usize, usize), Vector3<f64>)>],
) -> Vec<Vec<usize>> {
    jumpnetwork
        .iter()
        .map(|orbit| {
            let (ij0, dx0) = orbit[0];
            orbit
                .iter()
                .map(|&(ij, dx)| {
                    crystal
                        .group()
                        .iter()
                        .position(|g| jump_maps(crystal, chem, g, ij0, &dx0, ij, &dx))
                        // UNWRAP: the orbit was built from the same group
                        .unwrap_or_else(|| unreachable!())
                })
                .collect()
        })
        .collect()
}

fn jump_stabilizer(
    crystal: &Crystal,
    chem: usize,
    ((i, j), dx): ((usize, usize), Vector3<f64>),
) -> Vec<Matrix3<f64>> {
    crystal
        .group()
        .iter()
        .filter(|g| jump_maps(crystal, chem, g, (i, j), &dx, (i, j), &dx))
        .map(|g| g.cartrot)
        .collect()
}
