//! Lattice Green function: the oracle interface, the thermodynamic-kinetic
//! cache, and a reciprocal-space evaluator.
//!
//! The evaluator inverts the symmetrized rate matrix `W(k)` on a shifted
//! Monkhorst-Pack grid. The acoustic branch carries an integrable
//! `1/(k·D·k)` singularity at the zone center which ruins plain quadrature;
//! it is subtracted under a Gaussian damp and restored analytically through
//! the continuum error-function form in `D`-rescaled coordinates.

use crate::crystal::Crystal;
use crate::error::{Error, Result};
use crate::interstitial::Interstitial;
use itertools::iproduct;
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use num_complex::Complex64;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The lattice Green-function oracle consumed by the diffuser.
pub trait GreenFunction {
    /// Updates the internal vacancy rates from per-Wyckoff site and
    /// per-jump-type prefactors and scaled energies.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when an input length disagrees with the site
    /// list or jump network.
    fn set_rates(&mut self, pre: &[f64], betaene: &[f64], pre_t: &[f64], betaene_t: &[f64])
        -> Result<()>;

    /// Green-function value for the pair state `(i, j, dx)` at the current
    /// rates.
    ///
    /// # Errors
    ///
    /// [`Error::General`] if no rates have been set.
    fn eval(&self, i: usize, j: usize, dx: &Vector3<f64>) -> Result<f64>;

    /// Bare vacancy diffusivity for the current rates.
    ///
    /// # Errors
    ///
    /// [`Error::General`] if no rates have been set.
    fn diffusivity(&self) -> Result<Matrix3<f64>>;
}

/// Hashable key over a thermodynamic-kinetic input: site and transition
/// prefactors and scaled energies.
///
/// Equality and hashing run over a canonical representation rounded to
/// twelve decimal digits, so keys are stable against floating-point
/// representation jitter.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ThermoKinetics {
    /// Site prefactors.
    pub pre: Vec<f64>,
    /// Site energies times β.
    pub betaene: Vec<f64>,
    /// Transition-state prefactors.
    pub pre_t: Vec<f64>,
    /// Transition-state energies times β.
    pub betaene_t: Vec<f64>,
}

impl ThermoKinetics {
    #[allow(clippy::cast_possible_truncation)]
    fn canon(&self) -> Vec<i64> {
        self.pre
            .iter()
            .chain(&self.betaene)
            .chain(&self.pre_t)
            .chain(&self.betaene_t)
            .map(|&x| (x * 1e12).round() as i64)
            .collect()
    }
}

impl PartialEq for ThermoKinetics {
    fn eq(&self, other: &Self) -> bool {
        self.pre.len() == other.pre.len()
            && self.betaene.len() == other.betaene.len()
            && self.pre_t.len() == other.pre_t.len()
            && self.canon() == other.canon()
    }
}

impl Eq for ThermoKinetics {}

impl Hash for ThermoKinetics {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pre.len().hash(state);
        self.betaene.len().hash(state);
        self.pre_t.len().hash(state);
        self.canon().hash(state);
    }
}

/// One cached evaluation: the Green-function value per difference star and
/// the bare vacancy transport tensor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GfEntry {
    /// Green-function value for the representative of each difference star.
    pub gf: Vec<f64>,
    /// Bare vacancy diffusivity `L⁰_vv`.
    pub l0vv: Matrix3<f64>,
}

/// Unbounded memo of Green-function evaluations per thermodynamic-kinetic
/// key; read-mostly after warm-up.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GfCache {
    entries: FxHashMap<ThermoKinetics, GfEntry>,
}

impl GfCache {
    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &ThermoKinetics) -> Option<&GfEntry> {
        self.entries.get(key)
    }

    /// Stores an entry; never evicts.
    pub fn insert(&mut self, key: ThermoKinetics, entry: GfEntry) {
        self.entries.insert(key, entry);
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug)]
struct RateTable {
    kpoints: Vec<Vector3<f64>>,
    /// `W(k)⁻¹`, row-major `nsites × nsites` per k point.
    ginv: Vec<Vec<Complex64>>,
    /// `exp(−k·D·k/p²)/(k·D·k)` per k point.
    damp_over_kdk: Vec<f64>,
    /// Acoustic null-vector weights `sqrt(ρ_i)` per site.
    weights: Vec<f64>,
    dinv_sqrt: Matrix3<f64>,
    sqrt_det_d: f64,
    p: f64,
    diffusivity: Matrix3<f64>,
    nsites: usize,
}

/// Reciprocal-space Green-function evaluator.
///
/// `grid` is the number of divisions per reciprocal axis; the shifted grid
/// never samples the zone center. Accuracy improves roughly with the cube of
/// the grid due to the residual point discontinuity left after the acoustic
/// subtraction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KspaceGf {
    crystal: Arc<Crystal>,
    chem: usize,
    interstitial: Interstitial,
    grid: usize,
    #[serde(skip)]
    table: Option<RateTable>,
}

impl KspaceGf {
    /// Creates an evaluator on the given vacancy site list and ω₀ network.
    #[must_use]
    pub fn new(
        crystal: Arc<Crystal>,
        chem: usize,
        sitelist: Vec<Vec<usize>>,
        jumpnetwork: Vec<Vec<((usize, usize), Vector3<f64>)>>,
        grid: usize,
    ) -> Self {
        let interstitial =
            Interstitial::new(Arc::clone(&crystal), chem, sitelist, jumpnetwork);
        Self {
            crystal,
            chem,
            interstitial,
            grid,
            table: None,
        }
    }

    /// Grid divisions per reciprocal axis.
    #[must_use]
    pub const fn grid(&self) -> usize {
        self.grid
    }

    fn table(&self) -> Result<&RateTable> {
        self.table
            .as_ref()
            .ok_or_else(|| Error::General("Green-function rates have not been set".to_owned()))
    }
}

impl GreenFunction for KspaceGf {
    fn set_rates(
        &mut self,
        pre: &[f64],
        betaene: &[f64],
        pre_t: &[f64],
        betaene_t: &[f64],
    ) -> Result<()> {
        // shape checks happen inside the diffusivity evaluation
        let diffusivity = self
            .interstitial
            .diffusivity(pre, betaene, pre_t, betaene_t)?;
        let rho = self.interstitial.siteprob(pre, betaene);
        let weights: Vec<f64> = rho.iter().map(|&x| x.sqrt()).collect();
        let rates = self.interstitial.ratelist(pre, betaene, pre_t, betaene_t);
        let symmrates = self
            .interstitial
            .symmratelist(pre, betaene, pre_t, betaene_t);
        let nsites = weights.len();

        // flatten the directed jumps once
        let mut jumps: Vec<(usize, usize, Vector3<f64>, f64, f64)> = Vec::new();
        for ((orbit, rlist), slist) in self
            .interstitial
            .jumpnetwork()
            .iter()
            .zip(&rates)
            .zip(&symmrates)
        {
            for ((&((i, j), dx), &rate), &symmrate) in orbit.iter().zip(rlist).zip(slist) {
                jumps.push((i, j, dx, rate, symmrate));
            }
        }

        let eigen = SymmetricEigen::new(diffusivity);
        let sqrt_det_d = eigen.eigenvalues.iter().product::<f64>().sqrt();
        if !sqrt_det_d.is_finite() || sqrt_det_d <= 0.0 {
            return Err(Error::General(
                "bare diffusivity is not positive definite".to_owned(),
            ));
        }
        let mut dinv_sqrt = Matrix3::zeros();
        for (idx, &lambda) in eigen.eigenvalues.iter().enumerate() {
            let v: Vector3<f64> = eigen.eigenvectors.column(idx).clone_owned();
            dinv_sqrt += v * v.transpose() / lambda.sqrt();
        }

        // damping scale from the nearest zone face, measured in the metric D
        let recip = self.crystal.reciprocal_lattice();
        let mut face = f64::INFINITY;
        for (m0, m1, m2) in iproduct!(-1_i64..=1, -1_i64..=1, -1_i64..=1) {
            if (m0, m1, m2) == (0, 0, 0) {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let half = recip * Vector3::new(m0 as f64, m1 as f64, m2 as f64) * 0.5;
            face = face.min(half.dot(&(diffusivity * half)));
        }
        let p2 = face / 12.0;

        let n = self.grid;
        #[allow(clippy::cast_precision_loss)]
        let nf = n as f64;
        let mut kpoints = Vec::with_capacity(n * n * n);
        for (n0, n1, n2) in iproduct!(0..n, 0..n, 0..n) {
            #[allow(clippy::cast_precision_loss)]
            let frac = Vector3::new(
                (n0 as f64 + 0.5) / nf - 0.5,
                (n1 as f64 + 0.5) / nf - 0.5,
                (n2 as f64 + 0.5) / nf - 0.5,
            );
            kpoints.push(recip * frac);
        }

        let per_k: Vec<(Vec<Complex64>, f64)> = kpoints
            .par_iter()
            .map(|k| {
                let mut w = DMatrix::<Complex64>::zeros(nsites, nsites);
                for &(i, j, dx, rate, symmrate) in &jumps {
                    let phase = Complex64::from_polar(1.0, k.dot(&dx));
                    w[(i, j)] += symmrate * phase;
                    w[(i, i)] -= Complex64::from(rate);
                }
                let ginv = w
                    .try_inverse()
                    // UNWRAP: W(k) is nonsingular away from the zone center,
                    // which the shifted grid never samples
                    .unwrap_or_else(|| unreachable!());
                let kdk = k.dot(&(diffusivity * k));
                let damp = (-kdk / p2).exp() / kdk;
                (ginv.as_slice().to_vec(), damp)
            })
            .collect();
        let (ginv, damp_over_kdk) = per_k.into_iter().unzip();

        self.table = Some(RateTable {
            kpoints,
            ginv,
            damp_over_kdk,
            weights,
            dinv_sqrt,
            sqrt_det_d,
            p: p2.sqrt(),
            diffusivity,
            nsites,
        });
        Ok(())
    }

    fn eval(&self, i: usize, j: usize, dx: &Vector3<f64>) -> Result<f64> {
        let t = self.table()?;
        #[allow(clippy::cast_precision_loss)]
        let nk = t.kpoints.len() as f64;
        let uij = t.weights[i] * t.weights[j];
        // column-major storage from nalgebra: entry (i, j) sits at j*n + i
        let entry = j * t.nsites + i;
        let ksum: f64 = t
            .kpoints
            .par_iter()
            .zip(&t.ginv)
            .zip(&t.damp_over_kdk)
            .map(|((k, ginv), &damp)| {
                let theta = k.dot(dx);
                let phase = Complex64::from_polar(1.0, theta);
                (ginv[entry] * phase).re + uij * damp * theta.cos()
            })
            .sum();

        // analytic restoration of the damped continuum part
        let y = t.dinv_sqrt * dx;
        let r = y.norm();
        let vcell = self.crystal.volume();
        let analytic = if r < 1e-12 {
            vcell * t.p / (4.0 * std::f64::consts::PI.powf(1.5) * t.sqrt_det_d)
        } else {
            vcell * erf(0.5 * t.p * r)
                / (4.0 * std::f64::consts::PI * t.sqrt_det_d * r)
        };
        Ok(ksum / nk - uij * analytic)
    }

    fn diffusivity(&self) -> Result<Matrix3<f64>> {
        Ok(self.table()?.diffusivity)
    }
}

/// Error function via the Abramowitz & Stegun 7.1.26 rational approximation
/// (absolute error below 2e-7, well inside the quadrature error).
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (0.3275911_f64.mul_add(x, 1.0));
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn erf_reference_values() {
        assert_approx_eq!(f64, erf(0.0), 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, erf(0.5), 0.5204998778, epsilon = 1e-6);
        assert_approx_eq!(f64, erf(1.0), 0.8427007929, epsilon = 1e-6);
        assert_approx_eq!(f64, erf(-1.0), -0.8427007929, epsilon = 1e-6);
        assert_approx_eq!(f64, erf(3.0), 0.9999779095, epsilon = 1e-6);
    }

    #[test]
    fn thermo_kinetics_key_tolerates_jitter() {
        let key = |x: f64| ThermoKinetics {
            pre: vec![1.0],
            betaene: vec![x],
            pre_t: vec![1.0],
            betaene_t: vec![0.5],
        };
        let a = key(0.1 + 0.2);
        let b = key(0.3);
        assert_eq!(a, b);
        let mut cache = GfCache::default();
        cache.insert(a, GfEntry { gf: vec![1.0], l0vv: Matrix3::identity() });
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&key(0.31)).is_none());
        assert_eq!(cache.len(), 1);
    }

    fn fcc_gf() -> KspaceGf {
        let crys = Arc::new(Crystal::fcc(1.0).unwrap());
        let sitelist = crys.sitelist(0);
        let jn = crys.jumpnetwork(0, 0.75);
        let mut gf = KspaceGf::new(Arc::clone(&crys), 0, sitelist, jn, 32);
        gf.set_rates(&[1.0], &[0.0], &[1.0], &[0.0]).unwrap();
        gf
    }

    #[test]
    fn eval_before_rates_is_an_error() {
        let crys = Arc::new(Crystal::fcc(1.0).unwrap());
        let sitelist = crys.sitelist(0);
        let jn = crys.jumpnetwork(0, 0.75);
        let gf = KspaceGf::new(Arc::clone(&crys), 0, sitelist, jn, 8);
        assert!(gf.eval(0, 0, &Vector3::zeros()).is_err());
        assert!(gf.diffusivity().is_err());
    }

    #[test]
    fn fcc_green_function_satisfies_master_equation() {
        let gf = fcc_gf();
        let crys = Crystal::fcc(1.0).unwrap();
        let nn: Vec<Vector3<f64>> = crys.jumpnetwork(0, 0.75)[0]
            .iter()
            .map(|&(_, dx)| dx)
            .collect();
        // W·g = 1 at the origin
        let g0 = gf.eval(0, 0, &Vector3::zeros()).unwrap();
        let mut row: f64 = nn
            .iter()
            .map(|dx| gf.eval(0, 0, dx).unwrap())
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let z = nn.len() as f64;
        assert_approx_eq!(f64, row - z * g0, 1.0, epsilon = 2e-3);
        // W·g = 0 away from the origin
        let x0 = nn[0];
        let gx = gf.eval(0, 0, &x0).unwrap();
        row = nn
            .iter()
            .map(|dx| gf.eval(0, 0, &(x0 + dx)).unwrap())
            .sum();
        assert_approx_eq!(f64, row - z * gx, 0.0, epsilon = 2e-3);
        // symmetry: g only depends on the star of dx
        let g_nn: Vec<f64> = nn.iter().map(|dx| gf.eval(0, 0, dx).unwrap()).collect();
        for &g in &g_nn {
            assert_approx_eq!(f64, g, g_nn[0], epsilon = 1e-9);
        }
        assert!(g0 < 0.0);
    }

    #[test]
    fn hcp_green_function_satisfies_master_equation() {
        let crys = Arc::new(Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap());
        let sitelist = crys.sitelist(0);
        let jn = crys.jumpnetwork(0, 1.01);
        let mut gf = KspaceGf::new(Arc::clone(&crys), 0, sitelist, jn.clone(), 32);
        gf.set_rates(&[1.0], &[0.0], &[1.0, 1.0], &[0.0, 0.0]).unwrap();

        // W·g = 1 at the on-site diagonal entry for site 0
        let g0 = gf.eval(0, 0, &Vector3::zeros()).unwrap();
        let mut row = 0.0;
        let mut zcount = 0.0;
        for orbit in &jn {
            for &((i, j), dx) in orbit {
                if i == 0 {
                    row += gf.eval(j, 0, &-dx).unwrap();
                    zcount += 1.0;
                }
            }
        }
        assert_approx_eq!(f64, row - zcount * g0, 1.0, epsilon = 5e-3);
    }

    #[test]
    fn diffusivity_matches_interstitial_geometry() {
        let gf = fcc_gf();
        let d = gf.diffusivity().unwrap();
        assert_approx_eq!(f64, d[(0, 0)], 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, d[(0, 1)], 0.0, epsilon = 1e-12);
    }
}
