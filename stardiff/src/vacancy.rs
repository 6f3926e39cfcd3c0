//! Vacancy-mediated solute transport: the diffuser that assembles star sets,
//! vector stars, jump networks, expansions, and the Green function into the
//! Onsager coefficients `L_vv`, `L_ss`, `L_sv` (and the vacancy correction
//! `L¹_vv`).

use crate::crystal::Crystal;
use crate::error::{Error, Result};
use crate::gf::{GfCache, GfEntry, GreenFunction, KspaceGf, ThermoKinetics};
use crate::pairstate::PairState;
use crate::starset::{JumpNetwork, StarSet};
use crate::vstars::{BiasExpansions, RateExpansions, VectorStarSet};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use ndarray::{Array2, Array3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

/// Default reciprocal-grid divisions for the built-in Green-function
/// evaluator.
pub const DEFAULT_GF_GRID: usize = 64;

/// Identifies the serialized-diffuser blob format.
const BLOB_TAG: [u8; 8] = *b"SDIFFVM1";

/// Explicit configuration record of prefactors and energies: vacancy and
/// solute formation, solute-vacancy binding, and the three transition-state
/// families.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PreEne {
    /// Vacancy formation prefactor per Wyckoff position.
    pub pre_v: Vec<f64>,
    /// Vacancy formation energy per Wyckoff position.
    pub ene_v: Vec<f64>,
    /// Solute formation prefactor per Wyckoff position.
    pub pre_s: Vec<f64>,
    /// Solute formation energy per Wyckoff position.
    pub ene_s: Vec<f64>,
    /// Excess solute-vacancy binding prefactor per thermodynamic star.
    pub pre_sv: Vec<f64>,
    /// Solute-vacancy binding energy per thermodynamic star.
    pub ene_sv: Vec<f64>,
    /// ω₀ transition-state prefactor per jump type.
    pub pre_t0: Vec<f64>,
    /// ω₀ transition-state energy per jump type.
    pub ene_t0: Vec<f64>,
    /// ω₁ transition-state prefactor per jump.
    pub pre_t1: Vec<f64>,
    /// ω₁ transition-state energy per jump.
    pub ene_t1: Vec<f64>,
    /// ω₂ transition-state prefactor per jump.
    pub pre_t2: Vec<f64>,
    /// ω₂ transition-state energy per jump.
    pub ene_t2: Vec<f64>,
}

/// Scaled free energies `β·E − ln(prefactor)` with the documented reference
/// minima subtracted; the direct input of [`VacancyMediated::lij`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BetaFree {
    /// Vacancy site free energies (relative to their minimum).
    pub bf_v: Vec<f64>,
    /// Solute site free energies (relative to their minimum).
    pub bf_s: Vec<f64>,
    /// Excess solute-vacancy binding free energies.
    pub bf_sv: Vec<f64>,
    /// ω₀ transition free energies (relative to the vacancy minimum).
    pub bf_t0: Vec<f64>,
    /// ω₁ transition free energies (relative to vacancy + solute minima).
    pub bf_t1: Vec<f64>,
    /// ω₂ transition free energies (relative to vacancy + solute minima).
    pub bf_t2: Vec<f64>,
}

/// Everything derived from a thermodynamic shell; rebuilt from scratch when
/// the shell count changes.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct Generated {
    kinetic: StarSet,
    vkinetic: VectorStarSet,
    gfstarset: StarSet,
    gf_expansion: Array3<f64>,
    /// Kinetic star index of each thermodynamic star.
    thermo2kin: Vec<usize>,
    /// Vacancy Wyckoff position of each kinetic star.
    kin2vacancy: Vec<usize>,
    /// Kinetic stars outside the thermodynamic range.
    outerkin: Vec<usize>,
    /// Kinetic star of each vector star.
    vstar2kin: Vec<usize>,
    /// Vector stars living on each kinetic star.
    kin2vstar: Vec<Vec<usize>>,
    om1: JumpNetwork,
    om2: JumpNetwork,
    om1_rates: RateExpansions,
    om2_rates: RateExpansions,
    om1_bias: BiasExpansions,
    om2_bias: BiasExpansions,
    /// `(solute, vacancy)` Wyckoff pair of each kinetic star representative.
    kinetic_sv_wyckoff: Vec<(usize, usize)>,
    /// `(solute, vacancy)` site pair of each kinetic star representative.
    kinetic_sv_site: Vec<(usize, usize)>,
    /// Wyckoff pair of the endpoints of each ω₀ jump type.
    omega0_wyckoff: Vec<(usize, usize)>,
    /// `(s₁, v₁, s₂, v₂)` Wyckoff quadruple per ω₁ jump.
    omega1_svsv: Vec<(usize, usize, usize, usize)>,
    /// `(s₁, v₁, s₂, v₂)` Wyckoff quadruple per ω₂ jump.
    omega2_svsv: Vec<(usize, usize, usize, usize)>,
}

/// Vacancy-mediated solute transport calculator.
///
/// Generic over the Green-function oracle; [`VacancyMediated::new`] wires in
/// the built-in reciprocal-space evaluator.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VacancyMediated<G = KspaceGf> {
    crystal: Arc<Crystal>,
    chem: usize,
    sitelist: Vec<Vec<usize>>,
    invmap: Vec<usize>,
    jumpnetwork: Vec<Vec<((usize, usize), Vector3<f64>)>>,
    gf: G,
    thermo: StarSet,
    nnstar: StarSet,
    nthermo: usize,
    generated: Option<Generated>,
    cache: GfCache,
}

impl VacancyMediated<KspaceGf> {
    /// Creates a diffuser with the built-in Green-function evaluator and
    /// generates `nthermo` thermodynamic shells (zero defers generation).
    ///
    /// # Errors
    ///
    /// Propagates the shell-generation errors of [`Self::generate`].
    pub fn new(
        crystal: Arc<Crystal>,
        chem: usize,
        sitelist: Vec<Vec<usize>>,
        jumpnetwork: Vec<Vec<((usize, usize), Vector3<f64>)>>,
        nthermo: usize,
    ) -> Result<Self> {
        let gf = KspaceGf::new(
            Arc::clone(&crystal),
            chem,
            sitelist.clone(),
            jumpnetwork.clone(),
            DEFAULT_GF_GRID,
        );
        Self::with_oracle(crystal, chem, sitelist, jumpnetwork, gf, nthermo)
    }
}

impl<G> VacancyMediated<G> {
    /// Creates a diffuser around an externally supplied Green-function
    /// oracle.
    ///
    /// # Errors
    ///
    /// Propagates the shell-generation errors of [`Self::generate`].
    pub fn with_oracle(
        crystal: Arc<Crystal>,
        chem: usize,
        sitelist: Vec<Vec<usize>>,
        jumpnetwork: Vec<Vec<((usize, usize), Vector3<f64>)>>,
        gf: G,
        nthermo: usize,
    ) -> Result<Self> {
        let nsites = sitelist.iter().map(Vec::len).sum();
        let mut invmap = vec![0; nsites];
        for (w, sites) in sitelist.iter().enumerate() {
            for &i in sites {
                invmap[i] = w;
            }
        }
        let thermo = StarSet::new(Arc::clone(&crystal), chem, &jumpnetwork, 0);
        let nnstar = StarSet::new(Arc::clone(&crystal), chem, &jumpnetwork, 1);
        let mut diffuser = Self {
            crystal,
            chem,
            sitelist,
            invmap,
            jumpnetwork,
            gf,
            thermo,
            nnstar,
            nthermo: 0,
            generated: None,
            cache: GfCache::default(),
        };
        if nthermo > 0 {
            diffuser.generate(nthermo)?;
        }
        Ok(diffuser)
    }

    /// The crystal this diffuser runs on.
    #[must_use]
    pub fn crystal(&self) -> &Arc<Crystal> {
        &self.crystal
    }

    /// Number of generated thermodynamic shells.
    #[must_use]
    pub const fn nthermo(&self) -> usize {
        self.nthermo
    }

    /// The ω₀ jump network.
    #[must_use]
    pub fn omega0_network(&self) -> &[Vec<((usize, usize), Vector3<f64>)>] {
        &self.jumpnetwork
    }

    /// The Green-function cache (read access, for inspection).
    #[must_use]
    pub const fn cache(&self) -> &GfCache {
        &self.cache
    }

    fn generated(&self) -> Result<&Generated> {
        self.generated.as_ref().ok_or(Error::ShellNotInitialized)
    }

    /// (Re)generates stars, vector stars, jump networks, and expansions for
    /// `nthermo` shells; a repeat call with the current count is a no-op.
    /// Everything downstream, including the Green-function cache, is rebuilt.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] for `nthermo == 0`; otherwise
    /// propagates star-set and expansion construction failures (notably
    /// [`Error::OutOfShell`]).
    pub fn generate(&mut self, nthermo: usize) -> Result<()> {
        if nthermo == self.nthermo && self.generated.is_some() {
            return Ok(());
        }
        if nthermo == 0 {
            return Err(Error::ShellNotInitialized);
        }
        self.nthermo = nthermo;
        self.thermo.generate(nthermo);
        let kinetic = self.thermo.union(&self.nnstar)?;
        let vkinetic = VectorStarSet::new(&kinetic)?;

        let thermo2kin: Vec<usize> = self
            .thermo
            .stars()
            .iter()
            .map(|star| {
                kinetic
                    .starindex(&self.thermo.states()[star[0]])
                    // UNWRAP: the kinetic set contains the thermodynamic set
                    .unwrap_or_else(|| unreachable!())
            })
            .collect();
        let kin2vacancy: Vec<usize> = kinetic
            .stars()
            .iter()
            .map(|star| self.invmap[kinetic.states()[star[0]].j])
            .collect();
        let outerkin: Vec<usize> = (0..kinetic.nstars())
            .filter(|&s| {
                self.thermo
                    .stateindex(&kinetic.states()[kinetic.stars()[s][0]])
                    .is_none()
            })
            .collect();
        let vstar2kin: Vec<usize> = vkinetic
            .vecpos()
            .iter()
            .map(|positions| kinetic.star_of()[positions[0]])
            .collect();
        let kin2vstar: Vec<Vec<usize>> = (0..kinetic.nstars())
            .map(|s| {
                (0..vkinetic.nvstars())
                    .filter(|&v| vstar2kin[v] == s)
                    .collect()
            })
            .collect();

        let mut om1 = kinetic.jumpnetwork_omega1();
        let om2 = kinetic.jumpnetwork_omega2();
        // prune ω₁ jumps that connect two stars outside the thermodynamic
        // range; they carry no interaction and only inflate the networks
        let keep: Vec<bool> = om1
            .starpair
            .iter()
            .map(|&(a, b)| !(outerkin.contains(&a) && outerkin.contains(&b)))
            .collect();
        retain_by(&mut om1.jumps, &keep);
        retain_by(&mut om1.jumptype, &keep);
        retain_by(&mut om1.starpair, &keep);

        let (gf_expansion, gfstarset) = vkinetic.gf_expansion(&kinetic)?;
        let om1_rates = vkinetic.rate_expansions(&kinetic, &om1);
        let om2_rates = vkinetic.rate_expansions(&kinetic, &om2);
        let om1_bias = vkinetic.bias_expansions(&kinetic, &om1);
        let om2_bias = vkinetic.bias_expansions(&kinetic, &om2);

        let kinetic_sv_wyckoff: Vec<(usize, usize)> = kinetic
            .stars()
            .iter()
            .map(|star| {
                let ps = kinetic.states()[star[0]];
                (self.invmap[ps.i], self.invmap[ps.j])
            })
            .collect();
        let kinetic_sv_site: Vec<(usize, usize)> = kinetic
            .stars()
            .iter()
            .map(|star| {
                let ps = kinetic.states()[star[0]];
                (ps.i, ps.j)
            })
            .collect();
        let omega0_wyckoff: Vec<(usize, usize)> = self
            .jumpnetwork
            .iter()
            .map(|orbit| {
                let ((i, j), _) = orbit[0];
                (self.invmap[i], self.invmap[j])
            })
            .collect();
        let svsv = |network: &JumpNetwork| -> Vec<(usize, usize, usize, usize)> {
            network
                .jumps
                .iter()
                .map(|orbit| {
                    let ((is_, fs), _) = orbit[0];
                    let (psi, psf) = (kinetic.states()[is_], kinetic.states()[fs]);
                    (
                        self.invmap[psi.i],
                        self.invmap[psi.j],
                        self.invmap[psf.i],
                        self.invmap[psf.j],
                    )
                })
                .collect()
        };
        let omega1_svsv = svsv(&om1);
        let omega2_svsv = svsv(&om2);

        self.generated = Some(Generated {
            kinetic,
            vkinetic,
            gfstarset,
            gf_expansion,
            thermo2kin,
            kin2vacancy,
            outerkin,
            vstar2kin,
            kin2vstar,
            om1,
            om2,
            om1_rates,
            om2_rates,
            om1_bias,
            om2_bias,
            kinetic_sv_wyckoff,
            kinetic_sv_site,
            omega0_wyckoff,
            omega1_svsv,
            omega2_svsv,
        });
        // cached Green-function vectors are indexed by the difference stars,
        // which just changed
        self.cache = GfCache::default();
        Ok(())
    }

    /// Representatives of the thermodynamic-shell stars: the solute-vacancy
    /// configurations that carry an interaction energy.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] before a successful
    /// [`Self::generate`].
    pub fn interactlist(&self) -> Result<Vec<PairState>> {
        self.generated()?;
        Ok(self
            .thermo
            .stars()
            .iter()
            .map(|star| self.thermo.states()[star[0]])
            .collect())
    }

    /// Endpoint pairs of the symmetry-unique ω₁ (`which == 1`) or ω₂
    /// (`which == 2`) jumps, with their parent ω₀ jump types.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] before generation, or
    /// [`Error::General`] for an index other than 1 or 2.
    pub fn omegalist(&self, which: usize) -> Result<(Vec<(PairState, PairState)>, Vec<usize>)> {
        let gen = self.generated()?;
        let network = match which {
            1 => &gen.om1,
            2 => &gen.om2,
            _ => {
                return Err(Error::General(format!(
                    "five-frequency index must be 1 or 2, not {which}"
                )))
            }
        };
        let pairs = network
            .jumps
            .iter()
            .map(|orbit| {
                let ((is_, fs), _) = orbit[0];
                (gen.kinetic.states()[is_], gen.kinetic.states()[fs])
            })
            .collect();
        Ok((pairs, network.jumptype.clone()))
    }

    /// Fills a complete configuration record for an isotopic tracer: the
    /// solute is indistinguishable from the host, so every ω₁/ω₂ jump
    /// inherits its parent ω₀ prefactor and energy.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] before generation and
    /// [`Error::ShapeMismatch`] on wrong input lengths.
    pub fn tracer_pre_ene(
        &self,
        pre_v: &[f64],
        ene_v: &[f64],
        pre_t0: &[f64],
        ene_t0: &[f64],
    ) -> Result<PreEne> {
        let gen = self.generated()?;
        check_len("pre_v", pre_v.len(), self.sitelist.len())?;
        check_len("ene_v", ene_v.len(), self.sitelist.len())?;
        check_len("pre_t0", pre_t0.len(), self.jumpnetwork.len())?;
        check_len("ene_t0", ene_t0.len(), self.jumpnetwork.len())?;
        let lift = |network: &JumpNetwork, values: &[f64]| -> Vec<f64> {
            network.jumptype.iter().map(|&jt| values[jt]).collect()
        };
        Ok(PreEne {
            pre_v: pre_v.to_vec(),
            ene_v: ene_v.to_vec(),
            pre_s: vec![1.0; self.sitelist.len()],
            ene_s: vec![0.0; self.sitelist.len()],
            pre_sv: vec![1.0; self.thermo.nstars()],
            ene_sv: vec![0.0; self.thermo.nstars()],
            pre_t0: pre_t0.to_vec(),
            ene_t0: ene_t0.to_vec(),
            pre_t1: lift(&gen.om1, pre_t0),
            ene_t1: lift(&gen.om1, ene_t0),
            pre_t2: lift(&gen.om2, pre_t0),
            ene_t2: lift(&gen.om2, ene_t0),
        })
    }

    /// Fills a complete configuration record under the LIMB approximation
    /// (linearized interpolation of migration barriers): each ω₁/ω₂
    /// transition state averages the endpoint interactions on top of its
    /// parent ω₀ barrier.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] before generation and
    /// [`Error::ShapeMismatch`] on wrong input lengths.
    #[allow(clippy::too_many_arguments)]
    pub fn limb_pre_ene(
        &self,
        pre_v: &[f64],
        ene_v: &[f64],
        pre_s: &[f64],
        ene_s: &[f64],
        pre_sv: &[f64],
        ene_sv: &[f64],
        pre_t0: &[f64],
        ene_t0: &[f64],
    ) -> Result<PreEne> {
        let gen = self.generated()?;
        check_len("pre_v", pre_v.len(), self.sitelist.len())?;
        check_len("ene_v", ene_v.len(), self.sitelist.len())?;
        check_len("pre_s", pre_s.len(), self.sitelist.len())?;
        check_len("ene_s", ene_s.len(), self.sitelist.len())?;
        check_len("pre_sv", pre_sv.len(), self.thermo.nstars())?;
        check_len("ene_sv", ene_sv.len(), self.thermo.nstars())?;
        check_len("pre_t0", pre_t0.len(), self.jumpnetwork.len())?;
        check_len("ene_t0", ene_t0.len(), self.jumpnetwork.len())?;
        // interaction part per kinetic star (vacancy reference already sits
        // in the omega0 values)
        let mut ene_kin: Vec<f64> = gen
            .kinetic_sv_wyckoff
            .iter()
            .map(|&(s, _)| ene_s[s])
            .collect();
        let mut pre_kin: Vec<f64> = gen
            .kinetic_sv_wyckoff
            .iter()
            .map(|&(s, _)| pre_s[s])
            .collect();
        for (t, &k) in gen.thermo2kin.iter().enumerate() {
            ene_kin[k] += ene_sv[t];
            pre_kin[k] *= pre_sv[t];
        }
        let lift = |network: &JumpNetwork| -> (Vec<f64>, Vec<f64>) {
            network
                .jumptype
                .iter()
                .zip(&network.starpair)
                .map(|(&jt, &(st1, st2))| {
                    (
                        pre_t0[jt] * (pre_kin[st1] * pre_kin[st2]).sqrt(),
                        ene_t0[jt] + 0.5 * (ene_kin[st1] + ene_kin[st2]),
                    )
                })
                .unzip()
        };
        let (pre_t1, ene_t1) = lift(&gen.om1);
        let (pre_t2, ene_t2) = lift(&gen.om2);
        Ok(PreEne {
            pre_v: pre_v.to_vec(),
            ene_v: ene_v.to_vec(),
            pre_s: pre_s.to_vec(),
            ene_s: ene_s.to_vec(),
            pre_sv: pre_sv.to_vec(),
            ene_sv: ene_sv.to_vec(),
            pre_t0: pre_t0.to_vec(),
            ene_t0: ene_t0.to_vec(),
            pre_t1,
            ene_t1,
            pre_t2,
            ene_t2,
        })
    }

    fn check_beta_free(&self, bf: &BetaFree) -> Result<()> {
        let gen = self.generated()?;
        check_len("bf_v", bf.bf_v.len(), self.sitelist.len())?;
        check_len("bf_s", bf.bf_s.len(), self.sitelist.len())?;
        check_len("bf_sv", bf.bf_sv.len(), self.thermo.nstars())?;
        check_len("bf_t0", bf.bf_t0.len(), self.jumpnetwork.len())?;
        check_len("bf_t1", bf.bf_t1.len(), gen.om1.len())?;
        check_len("bf_t2", bf.bf_t2.len(), gen.om2.len())
    }

    /// Symmetric rates, escape rates, and reference escape rates for all
    /// three jump families.
    #[allow(clippy::similar_names, clippy::type_complexity)]
    fn symmetric_and_escape_rates(
        &self,
        bf: &BetaFree,
        bfsv_kin: &[f64],
    ) -> (
        Vec<f64>,
        Vec<f64>,
        Vec<f64>,
        Array2<f64>,
        Array2<f64>,
        Array2<f64>,
        Array2<f64>,
        Array2<f64>,
    ) {
        // UNWRAP: callers hold a generated diffuser
        let gen = self.generated.as_ref().unwrap_or_else(|| unreachable!());
        let nv = gen.vkinetic.nvstars();
        let n0 = self.jumpnetwork.len();

        let mut omega0 = vec![0.0; n0];
        let mut omega0escape = Array2::<f64>::zeros((self.sitelist.len(), n0));
        for (j, (&bft, &(v1, v2))) in bf.bf_t0.iter().zip(&gen.omega0_wyckoff).enumerate() {
            omega0escape[[v1, j]] = (-bft + bf.bf_v[v1]).exp();
            omega0escape[[v2, j]] = (-bft + bf.bf_v[v2]).exp();
            omega0[j] = (omega0escape[[v1, j]] * omega0escape[[v2, j]]).sqrt();
        }

        let family = |network: &JumpNetwork,
                      svsv: &[(usize, usize, usize, usize)],
                      bft: &[f64]|
         -> (Vec<f64>, Array2<f64>, Array2<f64>) {
            let mut omega = vec![0.0; network.len()];
            let mut escape = Array2::<f64>::zeros((nv, network.len()));
            let mut ref_escape = Array2::<f64>::zeros((nv, n0));
            for (j, ((&(s1, v1, s2, v2), &jt), (&(st1, st2), &bft_j))) in svsv
                .iter()
                .zip(&network.jumptype)
                .zip(network.starpair.iter().zip(bft))
                .enumerate()
            {
                let omf = (-bft_j + bf.bf_s[s1] + bf.bf_v[v1] + bfsv_kin[st1]).exp();
                let omb = (-bft_j + bf.bf_s[s2] + bf.bf_v[v2] + bfsv_kin[st2]).exp();
                omega[j] = (omf * omb).sqrt();
                for &vst in &gen.kin2vstar[st1] {
                    escape[[vst, j]] = omf;
                    ref_escape[[vst, jt]] = omega0escape[[v1, jt]];
                }
                for &vst in &gen.kin2vstar[st2] {
                    escape[[vst, j]] = omb;
                    ref_escape[[vst, jt]] = omega0escape[[v2, jt]];
                }
            }
            (omega, escape, ref_escape)
        };
        let (omega1, omega1escape, omega1_ref) = family(&gen.om1, &gen.omega1_svsv, &bf.bf_t1);
        let (omega2, omega2escape, omega2_ref) = family(&gen.om2, &gen.omega2_svsv, &bf.bf_t2);
        (
            omega0,
            omega1,
            omega2,
            omega0escape,
            omega1escape,
            omega2escape,
            omega1_ref,
            omega2_ref,
        )
    }
}

impl<G: GreenFunction> VacancyMediated<G> {
    /// Computes the Onsager transport tensors from scaled free energies.
    ///
    /// Returns `(L⁰_vv, L_ss, L_sv, L¹_vv)`; the first needs a factor
    /// `c_v/kT`, the others `c_v·c_s/kT`.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] before generation,
    /// [`Error::ShapeMismatch`] on wrong input lengths, and
    /// [`Error::General`] if the Dyson matrix turns out singular.
    #[allow(clippy::similar_names)]
    pub fn lij(
        &mut self,
        bf: &BetaFree,
    ) -> Result<(Matrix3<f64>, Matrix3<f64>, Matrix3<f64>, Matrix3<f64>)> {
        self.check_beta_free(bf)?;

        // 1. bare vacancy diffusivity and Green function, cached per
        //    thermodynamic-kinetic key
        let key = ThermoKinetics {
            pre: vec![1.0; bf.bf_v.len()],
            betaene: bf.bf_v.clone(),
            pre_t: vec![1.0; bf.bf_t0.len()],
            betaene_t: bf.bf_t0.clone(),
        };
        let entry = if let Some(entry) = self.cache.get(&key) {
            entry.clone()
        } else {
            self.gf
                .set_rates(&key.pre, &key.betaene, &key.pre_t, &key.betaene_t)?;
            let l0vv = self.gf.diffusivity()?;
            let gen = self.generated.as_ref().unwrap_or_else(|| unreachable!());
            let gf_values = gen
                .gfstarset
                .stars()
                .iter()
                .map(|star| {
                    let ps = gen.gfstarset.states()[star[0]];
                    self.gf.eval(ps.i, ps.j, &ps.dx)
                })
                .collect::<Result<Vec<f64>>>()?;
            let entry = GfEntry {
                gf: gf_values,
                l0vv,
            };
            self.cache.insert(key, entry.clone());
            entry
        };
        let gen = self.generated.as_ref().unwrap_or_else(|| unreachable!());
        let nv = gen.vkinetic.nvstars();
        #[allow(clippy::cast_precision_loss)]
        let nsites = self.invmap.len() as f64;

        // 2. site and pair probabilities
        let min = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
        let site_prob = |bfx: &[f64]| -> Vec<f64> {
            let m = min(bfx);
            let mut p: Vec<f64> = self.invmap.iter().map(|&w| (m - bfx[w]).exp()).collect();
            let total: f64 = p.iter().sum();
            for x in &mut p {
                *x *= nsites / total;
            }
            p
        };
        let prob_v = site_prob(&bf.bf_v);
        let prob_s = site_prob(&bf.bf_s);
        let prob_v_wyckoff: Vec<f64> = self
            .sitelist
            .iter()
            .map(|sites| prob_v[sites[0]])
            .collect();
        let mut bfsv_kin: Vec<f64> = vec![0.0; gen.kinetic.nstars()];
        let mut prob: Vec<f64> = gen
            .kinetic_sv_site
            .iter()
            .map(|&(si, vi)| prob_s[si] * prob_v[vi])
            .collect();
        for (t, &k) in gen.thermo2kin.iter().enumerate() {
            bfsv_kin[k] += bf.bf_sv[t];
            prob[k] *= (-bf.bf_sv[t]).exp();
        }

        // 3. symmetric and escape rates
        let (
            omega0,
            omega1,
            omega2,
            omega0escape,
            omega1escape,
            omega2escape,
            omega1_ref,
            omega2_ref,
        ) = self.symmetric_and_escape_rates(bf, &bfsv_kin);
        let gen = self.generated.as_ref().unwrap_or_else(|| unreachable!());

        // 4. projected rate deviation δω; the ω₂ off-diagonal keeps no ω₀
        //    reference because those jumps land on the (excluded) origin
        //    state, but the escape part must be referenced
        let mut delta_om = DMatrix::<f64>::zeros(nv, nv);
        for a in 0..nv {
            for b in 0..nv {
                let mut acc = 0.0;
                for (k, &w) in omega1.iter().enumerate() {
                    acc += gen.om1_rates.rate1[[a, b, k]] * w;
                }
                for (t, &w) in omega0.iter().enumerate() {
                    acc -= gen.om1_rates.rate0[[a, b, t]] * w;
                }
                for (k, &w) in omega2.iter().enumerate() {
                    acc += gen.om2_rates.rate1[[a, b, k]] * w;
                }
                delta_om[(a, b)] = acc;
            }
        }
        for sv in 0..nv {
            let mut acc = 0.0;
            for k in 0..gen.om1.len() {
                acc += gen.om1_rates.rate1_escape[[sv, k]] * omega1escape[[sv, k]];
            }
            for t in 0..self.jumpnetwork.len() {
                acc -= gen.om1_rates.rate0_escape[[sv, t]] * omega1_ref[[sv, t]];
                acc -= gen.om2_rates.rate0_escape[[sv, t]] * omega2_ref[[sv, t]];
            }
            for k in 0..gen.om2.len() {
                acc += gen.om2_rates.rate1_escape[[sv, k]] * omega2escape[[sv, k]];
            }
            delta_om[(sv, sv)] += acc;
        }

        // 5. bias vectors; the solute bias is the negative of its vacancy
        //    contribution and carries no reference term
        let mut bias_s = DVector::<f64>::zeros(nv);
        let mut bias_v = DVector::<f64>::zeros(nv);
        for (sv, &starindex) in gen.vstar2kin.iter().enumerate() {
            let vac = gen.kin2vacancy[starindex];
            let sqrt_prob = prob[starindex].sqrt();
            let sqrt_prob_v = prob_v_wyckoff[vac].sqrt();
            let mut b2 = 0.0;
            for k in 0..gen.om2.len() {
                b2 += gen.om2_bias.bias1[[sv, k]] * omega2escape[[sv, k]];
            }
            bias_s[sv] = -b2 * sqrt_prob;
            let mut b1 = 0.0;
            for k in 0..gen.om1.len() {
                b1 += gen.om1_bias.bias1[[sv, k]] * omega1escape[[sv, k]];
            }
            let mut b0 = 0.0;
            let mut b0_2 = 0.0;
            for t in 0..self.jumpnetwork.len() {
                b0 += gen.om1_bias.bias0[[sv, t]] * omega0escape[[vac, t]];
                b0_2 += gen.om2_bias.bias0[[sv, t]] * omega0escape[[vac, t]];
            }
            bias_v[sv] =
                b1 * sqrt_prob - b0 * sqrt_prob_v - bias_s[sv] - b0_2 * sqrt_prob_v;
        }

        // 6. Dyson solve in the vector-star basis
        let mut g0 = DMatrix::<f64>::zeros(nv, nv);
        for a in 0..nv {
            for b in 0..nv {
                let mut acc = 0.0;
                for (k, &gfk) in entry.gf.iter().enumerate() {
                    acc += gen.gf_expansion[[a, b, k]] * gfk;
                }
                g0[(a, b)] = acc;
            }
        }
        let m = DMatrix::<f64>::identity(nv, nv) + &g0 * &delta_om;
        let g = m
            .lu()
            .solve(&g0)
            .ok_or_else(|| Error::General("projected Dyson matrix is singular".to_owned()))?;
        let gb_s = &g * &bias_s;
        let gb_v = &g * &bias_v;

        // 7. assemble the transport tensors
        let contract = |x: &DVector<f64>, y: &DVector<f64>| -> Matrix3<f64> {
            let mut out = Matrix3::zeros();
            for a in 0..3 {
                for b in 0..3 {
                    let mut acc = 0.0;
                    for i in 0..nv {
                        for j in 0..nv {
                            acc += gen.vkinetic.outer()[[a, b, i, j]] * y[j] * x[i];
                        }
                    }
                    out[(a, b)] = acc / nsites;
                }
            }
            out
        };
        let l2ss = contract(&bias_s, &gb_s);
        let l1sv = contract(&bias_v, &gb_s);
        let l1vv = contract(&bias_v, &gb_v);

        let mut l0ss = Matrix3::<f64>::zeros();
        for (k, orbit) in gen.om2.jumps.iter().enumerate() {
            for &((i, _), dx) in orbit {
                let star = gen.kinetic.star_of()[i];
                let vst = gen.kin2vstar[star][0];
                l0ss += dx * dx.transpose() * 0.5 * omega2escape[[vst, k]] * prob[star];
            }
        }
        l0ss /= nsites;

        Ok((entry.l0vv, l0ss + l2ss, -l0ss + l1sv, l1vv))
    }
}

impl<G: Serialize> VacancyMediated<G> {
    /// Serializes the diffuser (crystal, star sets, networks, expansions,
    /// and the Green-function cache) as an LZ4-framed bincode blob.
    ///
    /// # Errors
    ///
    /// Propagates serialization and I/O failures.
    pub fn write(&self, writer: impl Write) -> Result<()> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
        bincode::serialize_into(&mut encoder, &BLOB_TAG)
            .map_err(|err| Error::Other(err.into()))?;
        bincode::serialize_into(&mut encoder, self).map_err(|err| Error::Other(err.into()))?;
        encoder
            .finish()
            .map_err(|err| Error::Other(err.into()))?;
        Ok(())
    }
}

impl<G: DeserializeOwned> VacancyMediated<G> {
    /// Restores a diffuser previously stored with [`Self::write`].
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] when the blob carries a different format tag;
    /// otherwise propagates deserialization and I/O failures.
    pub fn read(reader: impl Read) -> Result<Self> {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(reader);
        let tag: [u8; 8] =
            bincode::deserialize_from(&mut decoder).map_err(|err| Error::Other(err.into()))?;
        if tag != BLOB_TAG {
            return Err(Error::WrongType(format!(
                "blob tag {tag:?} is not a vacancy-mediated diffuser"
            )));
        }
        bincode::deserialize_from(&mut decoder).map_err(|err| Error::Other(err.into()))
    }
}

/// Converts a configuration record into scaled free energies
/// `β·E − ln(prefactor)`, subtracting the vacancy and solute minima so that
/// the transition values are referenced consistently.
#[must_use]
pub fn pre_ene_to_beta_free(kt: f64, data: &PreEne) -> BetaFree {
    let beta = 1.0 / kt;
    let bf = |pre: &[f64], ene: &[f64]| -> Vec<f64> {
        pre.iter()
            .zip(ene)
            .map(|(&p, &e)| beta.mul_add(e, -p.ln()))
            .collect()
    };
    let mut bf_v = bf(&data.pre_v, &data.ene_v);
    let mut bf_s = bf(&data.pre_s, &data.ene_s);
    let bf_sv = bf(&data.pre_sv, &data.ene_sv);
    let mut bf_t0 = bf(&data.pre_t0, &data.ene_t0);
    let mut bf_t1 = bf(&data.pre_t1, &data.ene_t1);
    let mut bf_t2 = bf(&data.pre_t2, &data.ene_t2);
    let min = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
    let (vmin, smin) = (min(&bf_v), min(&bf_s));
    for x in &mut bf_v {
        *x -= vmin;
    }
    for x in &mut bf_s {
        *x -= smin;
    }
    for x in &mut bf_t0 {
        *x -= vmin;
    }
    for x in &mut bf_t1 {
        *x -= vmin + smin;
    }
    for x in &mut bf_t2 {
        *x -= vmin + smin;
    }
    BetaFree {
        bf_v,
        bf_s,
        bf_sv,
        bf_t0,
        bf_t1,
        bf_t2,
    }
}

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

fn retain_by<T>(values: &mut Vec<T>, keep: &[bool]) {
    let mut it = keep.iter().copied();
    values.retain(|_| it.next().unwrap_or(true));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fcc_diffuser(nthermo: usize) -> VacancyMediated {
        let crys = Arc::new(Crystal::fcc(1.0).unwrap());
        let sitelist = crys.sitelist(0);
        let jn = crys.jumpnetwork(0, 0.75);
        VacancyMediated::new(Arc::clone(&crys), 0, sitelist, jn, nthermo).unwrap()
    }

    #[test]
    fn queries_require_a_generated_shell() {
        let diffuser = fcc_diffuser(0);
        assert!(matches!(
            diffuser.interactlist(),
            Err(Error::ShellNotInitialized)
        ));
        assert!(matches!(
            diffuser.omegalist(1),
            Err(Error::ShellNotInitialized)
        ));
    }

    #[test]
    fn interactlist_matches_thermo_stars() {
        let diffuser = fcc_diffuser(1);
        let interactions = diffuser.interactlist().unwrap();
        assert_eq!(interactions.len(), 1);
        assert!((interactions[0].dx.norm_squared() - 0.5).abs() < 1e-12);

        let two = fcc_diffuser(2);
        assert_eq!(two.interactlist().unwrap().len(), 4);
    }

    #[test]
    fn omegalist_endpoints_are_kinetic_states() {
        let diffuser = fcc_diffuser(1);
        let (pairs2, types2) = diffuser.omegalist(2).unwrap();
        assert_eq!(pairs2.len(), types2.len());
        for (a, b) in &pairs2 {
            assert_eq!(*b, -*a);
        }
        let (pairs1, _) = diffuser.omegalist(1).unwrap();
        assert!(!pairs1.is_empty());
        assert!(diffuser.omegalist(3).is_err());
    }

    #[test]
    fn tracer_record_inherits_parent_jump_values() {
        let diffuser = fcc_diffuser(1);
        let data = diffuser
            .tracer_pre_ene(&[1.0], &[0.0], &[2.0], &[0.25])
            .unwrap();
        assert!(data.pre_t1.iter().all(|&x| (x - 2.0).abs() < 1e-12));
        assert!(data.ene_t2.iter().all(|&x| (x - 0.25).abs() < 1e-12));
        assert_eq!(data.pre_sv.len(), 1);
    }

    #[test]
    fn limb_without_interactions_reduces_to_tracer() {
        let diffuser = fcc_diffuser(2);
        let tracer = diffuser
            .tracer_pre_ene(&[1.0], &[0.0], &[1.5], &[0.4])
            .unwrap();
        let limb = diffuser
            .limb_pre_ene(
                &[1.0],
                &[0.0],
                &[1.0],
                &[0.0],
                &[1.0, 1.0, 1.0, 1.0],
                &[0.0, 0.0, 0.0, 0.0],
                &[1.5],
                &[0.4],
            )
            .unwrap();
        assert_eq!(tracer.pre_t1, limb.pre_t1);
        assert_eq!(tracer.ene_t2, limb.ene_t2);
    }

    #[test]
    fn beta_free_subtracts_reference_minima() {
        let data = PreEne {
            pre_v: vec![1.0, 2.0],
            ene_v: vec![0.5, 0.25],
            pre_s: vec![1.0, 1.0],
            ene_s: vec![0.75, 1.0],
            pre_sv: vec![1.0],
            ene_sv: vec![0.1],
            pre_t0: vec![1.0],
            ene_t0: vec![1.0],
            pre_t1: vec![1.0],
            ene_t1: vec![1.0],
            pre_t2: vec![1.0],
            ene_t2: vec![1.0],
        };
        let bf = pre_ene_to_beta_free(2.0, &data);
        let vmin = bf.bf_v.iter().copied().fold(f64::INFINITY, f64::min);
        let smin = bf.bf_s.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(vmin.abs() < 1e-12);
        assert!(smin.abs() < 1e-12);
        // raw vacancy minimum is 0.25/2 - ln 2 on the second Wyckoff slot
        let raw_vmin = 0.125 - std::f64::consts::LN_2;
        assert!((bf.bf_t0[0] - (0.5 - raw_vmin)).abs() < 1e-12);
        assert!((bf.bf_sv[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn omega1_network_respects_thermo_pruning() {
        let diffuser = fcc_diffuser(1);
        let gen = diffuser.generated.as_ref().unwrap();
        for &(a, b) in &gen.om1.starpair {
            assert!(!(gen.outerkin.contains(&a) && gen.outerkin.contains(&b)));
        }
        // omega2 endpoints always carry an interaction
        assert_eq!(gen.om2.len(), 1);
    }
}
