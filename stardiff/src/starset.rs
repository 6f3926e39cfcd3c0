//! Star sets: enumeration of pair states within a shell count and their
//! decomposition into point-group orbits, plus the derived ω₁/ω₂ jump
//! networks.

use crate::crystal::Crystal;
use crate::error::{Error, Result};
use crate::pairstate::PairState;
use nalgebra::Vector3;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Tolerance separating squared-magnitude shells during star partitioning.
pub const MAG_TOL: f64 = 1e-8;

/// A jump network between enumerated pair states: symmetry-unique orbits of
/// `((initial, final), dx)` entries, tagged with the parent ω₀ jump type and
/// the star pair of the endpoints.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JumpNetwork {
    /// Orbits of `((IS, FS), dx)`; state indices into the parent star set.
    pub jumps: Vec<Vec<((usize, usize), Vector3<f64>)>>,
    /// Parent ω₀ jump type per orbit.
    pub jumptype: Vec<usize>,
    /// `(star(IS), star(FS))` per orbit.
    pub starpair: Vec<(usize, usize)>,
}

impl JumpNetwork {
    /// Number of symmetry-unique jumps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jumps.len()
    }

    /// `true` when the network has no jumps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jumps.is_empty()
    }
}

/// The set of pair states reachable within a number of shells, partitioned
/// into orbits ("stars") under the crystal's space group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StarSet {
    crystal: Arc<Crystal>,
    chem: usize,
    jumplist: Vec<PairState>,
    jumpnetwork_index: Vec<Vec<usize>>,
    nshells: Option<usize>,
    states: Vec<PairState>,
    stars: Vec<Vec<usize>>,
    index: Vec<usize>,
    index_map: FxHashMap<PairState, (usize, usize)>,
}

fn cmp_states(a: &PairState, b: &PairState) -> Ordering {
    let (na, nb) = (a.norm2(), b.norm2());
    if (na - nb).abs() > MAG_TOL {
        na.partial_cmp(&nb).unwrap_or(Ordering::Equal)
    } else {
        (a.i, a.j, a.r).cmp(&(b.i, b.j, b.r))
    }
}

impl StarSet {
    /// Creates a star set for the ω₀ `jumpnetwork` of species `chem` and
    /// generates `nshells` shells.
    #[must_use]
    pub fn new(
        crystal: Arc<Crystal>,
        chem: usize,
        jumpnetwork: &[Vec<((usize, usize), Vector3<f64>)>],
        nshells: usize,
    ) -> Self {
        let mut jumplist = Vec::new();
        let mut jumpnetwork_index = Vec::new();
        for orbit in jumpnetwork {
            let mut indices = Vec::with_capacity(orbit.len());
            for &(ij, dx) in orbit {
                indices.push(jumplist.len());
                jumplist.push(PairState::from_jump(&crystal, chem, ij, dx));
            }
            jumpnetwork_index.push(indices);
        }
        let mut set = Self {
            crystal,
            chem,
            jumplist,
            jumpnetwork_index,
            nshells: None,
            states: Vec::new(),
            stars: Vec::new(),
            index: Vec::new(),
            index_map: FxHashMap::default(),
        };
        set.generate(nshells);
        set
    }

    /// Regenerates the state set out to `nshells` shells; calling with the
    /// current shell count is a no-op. Zero states are excluded.
    pub fn generate(&mut self, nshells: usize) {
        self.generate_impl(nshells, false);
    }

    /// Like [`Self::generate`], but also includes the zero ("origin") states,
    /// one per basis site.
    pub fn generate_with_origin(&mut self, nshells: usize) {
        self.generate_impl(nshells, true);
    }

    fn generate_impl(&mut self, nshells: usize, origin: bool) {
        if self.nshells == Some(nshells) {
            return;
        }
        self.nshells = Some(nshells);
        let mut stateset: FxHashSet<PairState> = if nshells > 0 {
            self.jumplist.iter().copied().collect()
        } else {
            FxHashSet::default()
        };
        let mut lastshell = stateset.clone();
        if origin {
            for n in 0..self.crystal.num_sites(self.chem) {
                stateset.insert(PairState::zero(n));
            }
        }
        for _ in 1..nshells.max(1) {
            let mut nextshell = FxHashSet::default();
            for s1 in &lastshell {
                for s2 in &self.jumplist {
                    if let Ok(s) = s1.compose(s2) {
                        if !s.is_zero() && !stateset.contains(&s) {
                            nextshell.insert(s);
                        }
                    }
                }
            }
            stateset.extend(nextshell.iter().copied());
            lastshell = nextshell;
        }
        let mut states: Vec<PairState> = stateset.into_iter().collect();
        states.sort_unstable_by(cmp_states);
        self.states = states;
        self.stars = self.partition(0, self.states.len());
        self.rebuild_index();
    }

    /// Partitions `states[lo..hi]` into orbits, bucketing by squared
    /// magnitude first so only same-length states are compared.
    fn partition(&self, lo: usize, hi: usize) -> Vec<Vec<usize>> {
        let mut stars = Vec::new();
        let mut start = lo;
        while start < hi {
            let mag = self.states[start].norm2();
            let mut end = start;
            while end < hi && self.states[end].norm2() <= mag + MAG_TOL {
                end += 1;
            }
            let mut bucket_stars: Vec<Vec<usize>> = Vec::new();
            let mut images: Vec<FxHashSet<PairState>> = Vec::new();
            for xi in start..end {
                let x = self.states[xi];
                if let Some(k) = images.iter().position(|set| set.contains(&x)) {
                    bucket_stars[k].push(xi);
                } else {
                    images.push(
                        self.crystal
                            .group()
                            .iter()
                            .map(|g| x.apply(&self.crystal, self.chem, g))
                            .collect(),
                    );
                    bucket_stars.push(vec![xi]);
                }
            }
            stars.extend(bucket_stars);
            start = end;
        }
        stars
    }

    fn rebuild_index(&mut self) {
        self.index = vec![0; self.states.len()];
        self.index_map = FxHashMap::default();
        for (si, star) in self.stars.iter().enumerate() {
            for &xi in star {
                self.index[xi] = si;
                self.index_map.insert(self.states[xi], (xi, si));
            }
        }
    }

    /// The underlying crystal.
    #[must_use]
    pub fn crystal(&self) -> &Arc<Crystal> {
        &self.crystal
    }

    /// Chemical species index of the mobile atom.
    #[must_use]
    pub const fn chem(&self) -> usize {
        self.chem
    }

    /// Number of generated shells (zero before any generation).
    #[must_use]
    pub fn nshells(&self) -> usize {
        self.nshells.unwrap_or(0)
    }

    /// All enumerated states, ordered by squared magnitude.
    #[must_use]
    pub fn states(&self) -> &[PairState] {
        &self.states
    }

    /// The orbits as lists of state indices.
    #[must_use]
    pub fn stars(&self) -> &[Vec<usize>] {
        &self.stars
    }

    /// Number of states.
    #[must_use]
    pub fn nstates(&self) -> usize {
        self.states.len()
    }

    /// Number of stars.
    #[must_use]
    pub fn nstars(&self) -> usize {
        self.stars.len()
    }

    /// Star index of each state.
    #[must_use]
    pub fn star_of(&self) -> &[usize] {
        &self.index
    }

    /// The single-jump pair states the shells are built from.
    #[must_use]
    pub fn jumplist(&self) -> &[PairState] {
        &self.jumplist
    }

    /// Indices into [`Self::jumplist`] grouped by ω₀ jump type.
    #[must_use]
    pub fn jumpnetwork_index(&self) -> &[Vec<usize>] {
        &self.jumpnetwork_index
    }

    /// Index of `ps` in the state list, if enumerated.
    #[must_use]
    pub fn stateindex(&self, ps: &PairState) -> Option<usize> {
        self.index_map.get(ps).map(|&(xi, _)| xi)
    }

    /// Star index of `ps`, if enumerated.
    #[must_use]
    pub fn starindex(&self, ps: &PairState) -> Option<usize> {
        self.index_map.get(ps).map(|&(_, si)| si)
    }

    /// `true` if some group operation carries `a` onto `b`.
    #[must_use]
    pub fn symmatch(&self, a: &PairState, b: &PairState) -> bool {
        self.crystal
            .group()
            .iter()
            .any(|g| *a == b.apply(&self.crystal, self.chem, g))
    }

    /// Union of two star sets on the same crystal and species: all states of
    /// both plus their compositions, partitioned afresh beyond the states of
    /// the larger operand.
    ///
    /// # Errors
    ///
    /// [`Error::WrongType`] if the species differ.
    pub fn union(&self, other: &Self) -> Result<Self> {
        if self.chem != other.chem {
            return Err(Error::WrongType(format!(
                "cannot combine star sets for species {} and {}",
                self.chem, other.chem
            )));
        }
        let (big, small) = if self.nshells() >= other.nshells() {
            (self, other)
        } else {
            (other, self)
        };
        if small.nshells() < 1 {
            return Ok(big.clone());
        }
        let mut out = big.clone();
        out.nshells = Some(big.nshells() + small.nshells());
        let old: FxHashSet<PairState> = out.states.iter().copied().collect();
        let mut fresh: FxHashSet<PairState> = FxHashSet::default();
        for s1 in &big.states {
            for s2 in &small.states {
                if let Ok(s) = s1.compose(s2) {
                    if !s.is_zero() && !old.contains(&s) {
                        fresh.insert(s);
                    }
                }
            }
        }
        let nold = out.states.len();
        let mut new_states: Vec<PairState> = fresh.into_iter().collect();
        new_states.sort_unstable_by(cmp_states);
        out.states.extend(new_states);
        let new_stars = out.partition(nold, out.states.len());
        out.stars.extend(new_stars);
        out.rebuild_index();
        Ok(out)
    }

    /// Builds the endpoint-difference star set `{ sB ^ sA }` between two star
    /// sets; this is the state set the Green function is tabulated over, and
    /// it includes the zero states.
    ///
    /// # Errors
    ///
    /// [`Error::ShellNotInitialized`] if either operand has no shells, and
    /// [`Error::WrongType`] if the species differ.
    pub fn diffgenerate(a: &Self, b: &Self) -> Result<Self> {
        if a.chem != b.chem {
            return Err(Error::WrongType(format!(
                "cannot difference star sets for species {} and {}",
                a.chem, b.chem
            )));
        }
        if a.nshells() < 1 || b.nshells() < 1 {
            return Err(Error::ShellNotInitialized);
        }
        let mut stateset: FxHashSet<PairState> = FxHashSet::default();
        for s1 in &a.states {
            for s2 in &b.states {
                if let Ok(s) = s2.endpoint_sub(s1) {
                    stateset.insert(s);
                }
            }
        }
        let mut out = Self {
            crystal: Arc::clone(&a.crystal),
            chem: a.chem,
            jumplist: a.jumplist.clone(),
            jumpnetwork_index: a.jumpnetwork_index.clone(),
            nshells: Some(a.nshells() + b.nshells()),
            states: stateset.into_iter().collect(),
            stars: Vec::new(),
            index: Vec::new(),
            index_map: FxHashMap::default(),
        };
        out.states.sort_unstable_by(cmp_states);
        out.stars = out.partition(0, out.states.len());
        out.rebuild_index();
        Ok(out)
    }

    /// Derives the ω₁ network: vacancy hops between enumerated states with
    /// the solute fixed. Jumps whose final state leaves the enumeration are
    /// skipped; so are jumps into or out of the zero state.
    #[must_use]
    pub fn jumpnetwork_omega1(&self) -> JumpNetwork {
        let mut network = JumpNetwork::default();
        if self.nshells() < 1 {
            return network;
        }
        let mut seen: FxHashSet<(usize, usize)> = FxHashSet::default();
        for (jt, jumpindices) in self.jumpnetwork_index.iter().enumerate() {
            for jump in jumpindices.iter().map(|&ji| self.jumplist[ji]) {
                for (i, psi) in self.states.iter().enumerate() {
                    if psi.is_zero() {
                        continue;
                    }
                    let Ok(psf) = psi.compose(&jump) else {
                        continue;
                    };
                    if psf.is_zero() {
                        continue;
                    }
                    let Some(f) = self.stateindex(&psf) else {
                        continue; // outside our star set
                    };
                    if seen.contains(&(i, f)) {
                        continue;
                    }
                    let orbit = self.symm_equiv_jumps(i, f, psf.dx - psi.dx);
                    seen.extend(orbit.iter().map(|&(pair, _)| pair));
                    network.jumps.push(orbit);
                    network.jumptype.push(jt);
                    network.starpair.push((self.index[i], self.index[f]));
                }
            }
        }
        network
    }

    /// Derives the ω₂ network: solute-vacancy exchange. Only jumps that land
    /// on the zero state are kept; the recorded final state is the exchanged
    /// (negated) initial state.
    #[must_use]
    pub fn jumpnetwork_omega2(&self) -> JumpNetwork {
        let mut network = JumpNetwork::default();
        if self.nshells() < 1 {
            return network;
        }
        let mut seen: FxHashSet<(usize, usize)> = FxHashSet::default();
        for (jt, jumpindices) in self.jumpnetwork_index.iter().enumerate() {
            for jump in jumpindices.iter().map(|&ji| self.jumplist[ji]) {
                for (i, psi) in self.states.iter().enumerate() {
                    if psi.is_zero() {
                        continue;
                    }
                    let Ok(psf) = psi.compose(&jump) else {
                        continue;
                    };
                    if !psf.is_zero() {
                        continue;
                    }
                    let f = self
                        .stateindex(&-*psi)
                        // UNWRAP: the state set is closed under negation
                        .unwrap_or_else(|| unreachable!());
                    if seen.contains(&(i, f)) {
                        continue;
                    }
                    let orbit = self.symm_equiv_jumps(i, f, -psi.dx);
                    seen.extend(orbit.iter().map(|&(pair, _)| pair));
                    network.jumps.push(orbit);
                    network.jumptype.push(jt);
                    network.starpair.push((self.index[i], self.index[f]));
                }
            }
        }
        network
    }

    /// Orbit of the jump `(i, f, dx)` under the group, each ordered pair at
    /// most once, reverses included.
    fn symm_equiv_jumps(&self, i: usize, f: usize, dx: Vector3<f64>) -> Vec<((usize, usize), Vector3<f64>)> {
        let psi = self.states[i];
        let psf = self.states[f];
        let mut orbit = vec![((i, f), dx)];
        if i != f {
            orbit.push(((f, i), -dx));
        }
        for g in self.crystal.group() {
            let gi = self
                .stateindex(&psi.apply(&self.crystal, self.chem, g))
                // UNWRAP: the state set is closed under the group
                .unwrap_or_else(|| unreachable!());
            let gf = self
                .stateindex(&psf.apply(&self.crystal, self.chem, g))
                .unwrap_or_else(|| unreachable!());
            if orbit.iter().any(|&((a, b), _)| a == gi && b == gf) {
                continue;
            }
            let gdx = Crystal::g_direc(g, &dx);
            orbit.push(((gi, gf), gdx));
            if gi != gf {
                orbit.push(((gf, gi), -gdx));
            }
        }
        orbit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fcc_starset(nshells: usize) -> StarSet {
        let crys = Arc::new(Crystal::fcc(1.0).unwrap());
        let jn = crys.jumpnetwork(0, 0.75);
        StarSet::new(crys, 0, &jn, nshells)
    }

    #[test]
    fn fcc_one_shell_is_one_star_of_twelve() {
        let set = fcc_starset(1);
        assert_eq!(set.nstates(), 12);
        assert_eq!(set.nstars(), 1);
        assert_eq!(set.stars()[0].len(), 12);
    }

    #[test]
    fn fcc_two_shells_star_sizes() {
        let set = fcc_starset(2);
        // <110>, <200>, <211>, <220> shells
        assert_eq!(set.nstars(), 4);
        let sizes: Vec<usize> = set.stars().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![12, 6, 24, 12]);
        assert_eq!(set.nstates(), 54);
    }

    #[test]
    fn states_closed_under_group_and_stars_partition() {
        let set = fcc_starset(2);
        let crys = Arc::clone(set.crystal());
        for s in set.states() {
            for g in crys.group() {
                let gs = s.apply(&crys, 0, g);
                let si = set.stateindex(&gs).expect("image enumerated");
                assert_eq!(set.star_of()[si], set.starindex(s).unwrap());
            }
        }
        // disjoint cover
        let mut seen = vec![false; set.nstates()];
        for star in set.stars() {
            for &xi in star {
                assert!(!seen[xi]);
                seen[xi] = true;
            }
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn states_sorted_by_magnitude() {
        let set = fcc_starset(2);
        for w in set.states().windows(2) {
            assert!(w[0].norm2() <= w[1].norm2() + MAG_TOL);
        }
    }

    #[test]
    fn zero_state_is_excluded_by_default() {
        let set = fcc_starset(2);
        assert!(set.stateindex(&PairState::zero(0)).is_none());

        let crys = Arc::clone(set.crystal());
        let jn = crys.jumpnetwork(0, 0.75);
        let mut with_origin = StarSet::new(Arc::clone(&crys), 0, &jn, 0);
        with_origin.generate_with_origin(1);
        assert!(with_origin.stateindex(&PairState::zero(0)).is_some());
    }

    #[test]
    fn regenerate_same_shells_is_noop() {
        let mut set = fcc_starset(2);
        let states = set.states().to_vec();
        set.generate(2);
        assert_eq!(set.states(), &states[..]);
    }

    #[test]
    fn union_of_single_shells_matches_two_shells() {
        let one = fcc_starset(1);
        let two = fcc_starset(2);
        let combined = one.union(&one).unwrap();
        assert_eq!(combined.nshells(), 2);
        assert_eq!(combined.nstates(), two.nstates());
        for s in two.states() {
            assert!(combined.stateindex(s).is_some());
        }
    }

    #[test]
    fn diffgenerate_contains_zero_and_differences() {
        let one = fcc_starset(1);
        let diff = StarSet::diffgenerate(&one, &one).unwrap();
        assert!(diff.stateindex(&PairState::zero(0)).is_some());
        for a in one.states() {
            for b in one.states() {
                let ds = b.endpoint_sub(a).unwrap();
                assert!(diff.stateindex(&ds).is_some());
            }
        }
    }

    #[test]
    fn omega2_exchanges_with_negated_state() {
        let set = fcc_starset(1);
        let om2 = set.jumpnetwork_omega2();
        assert_eq!(om2.len(), 1);
        assert_eq!(om2.jumps[0].len(), 12);
        for &((i, f), dx) in &om2.jumps[0] {
            let psi = set.states()[i];
            assert_eq!(set.states()[f], -psi);
            assert!((dx + psi.dx).norm() < 1e-12);
        }
    }

    #[test]
    fn omega1_contains_reverses() {
        let set = fcc_starset(2);
        let om1 = set.jumpnetwork_omega1();
        assert!(!om1.is_empty());
        assert_eq!(om1.jumps.len(), om1.jumptype.len());
        assert_eq!(om1.jumps.len(), om1.starpair.len());
        for orbit in &om1.jumps {
            for &((i, f), dx) in orbit {
                assert!(
                    orbit
                        .iter()
                        .any(|&((a, b), dxr)| a == f && b == i && (dxr + dx).norm() < 1e-12),
                    "reverse jump must appear in the same orbit"
                );
            }
        }
    }

    #[test]
    fn omega1_displacements_match_omega0(){
        let set = fcc_starset(2);
        let om1 = set.jumpnetwork_omega1();
        let nn_len2 = 0.5;
        for orbit in &om1.jumps {
            for &((i, f), dx) in orbit {
                assert!((dx.norm_squared() - nn_len2).abs() < 1e-10);
                let (psi, psf) = (set.states()[i], set.states()[f]);
                assert!(((psf.dx - psi.dx) - dx).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn union_rejects_mixed_species() {
        let crys = Arc::new(Crystal::hcp(1.0, (8.0_f64 / 3.0).sqrt()).unwrap());
        let jn = crys.jumpnetwork(0, 1.01);
        let a = StarSet::new(Arc::clone(&crys), 0, &jn, 1);
        let mut b = a.clone();
        b.chem = 1;
        assert!(matches!(a.union(&b), Err(Error::WrongType(_))));
    }
}
