//! End-to-end isotopic tracer scenarios: the correlation factors of FCC and
//! BCC vacancy-mediated self-diffusion and the tracer-limit identities of the
//! transport tensors.

use float_cmp::assert_approx_eq;
use nalgebra::Matrix3;
use stardiff::crystal::Crystal;
use stardiff::vacancy::{pre_ene_to_beta_free, VacancyMediated};
use std::sync::Arc;

fn tracer_lij(
    crystal: Crystal,
    cutoff: f64,
    nthermo: usize,
    ene_t0: f64,
    kt: f64,
) -> (
    VacancyMediated,
    (Matrix3<f64>, Matrix3<f64>, Matrix3<f64>, Matrix3<f64>),
) {
    let crystal = Arc::new(crystal);
    let sitelist = crystal.sitelist(0);
    let jumpnetwork = crystal.jumpnetwork(0, cutoff);
    let n0 = jumpnetwork.len();
    let mut diffuser =
        VacancyMediated::new(Arc::clone(&crystal), 0, sitelist, jumpnetwork, nthermo).unwrap();
    let data = diffuser
        .tracer_pre_ene(&[1.0], &[0.0], &vec![1.0; n0], &vec![ene_t0; n0])
        .unwrap();
    let bf = pre_ene_to_beta_free(kt, &data);
    let tensors = diffuser.lij(&bf).unwrap();
    (diffuser, tensors)
}

fn assert_isotropic(m: &Matrix3<f64>, value: f64, epsilon: f64) {
    for a in 0..3 {
        for b in 0..3 {
            let expected = if a == b { value } else { 0.0 };
            assert_approx_eq!(f64, m[(a, b)], expected, epsilon = epsilon);
        }
    }
}

#[test]
fn fcc_tracer_correlation() {
    let (_, (l0vv, lss, lsv, l1vv)) = tracer_lij(Crystal::fcc(1.0).unwrap(), 0.75, 2, 0.0, 1.0);
    // bare vacancy diffusivity: 12 jumps of length 1/sqrt(2) at unit rate
    assert_isotropic(&l0vv, 1.0, 1e-10);

    // the correlated solute transport carries the FCC correlation factor
    let f0 = lss[(0, 0)] / l0vv[(0, 0)];
    assert_approx_eq!(f64, f0, 0.7815, epsilon = 2e-3);
    assert_isotropic(&lss, f0, 1e-6);

    // isotope limits: the vacancy sees no interaction, so its bias vanishes;
    // the off-diagonal reduces to the bare exchange term and the solute
    // correction to the vacancy transport disappears
    assert_isotropic(&lsv, -l0vv[(0, 0)], 2e-3);
    assert!(l1vv.norm() < 1e-8);
    // equivalent vacancy-wind form of the tracer limit
    assert!((lss + lsv * f0).norm() < 5e-3);
}

#[test]
fn bcc_tracer_correlation() {
    let (_, (l0vv, lss, lsv, l1vv)) = tracer_lij(Crystal::bcc(1.0).unwrap(), 0.9, 2, 0.0, 1.0);
    // 8 jumps of length sqrt(3)/2 at unit rate
    assert_isotropic(&l0vv, 1.0, 1e-10);
    let f0 = lss[(0, 0)] / l0vv[(0, 0)];
    assert_approx_eq!(f64, f0, 0.7272, epsilon = 2e-3);
    assert_isotropic(&lsv, -l0vv[(0, 0)], 2e-3);
    assert!(l1vv.norm() < 1e-8);
}

#[test]
fn correlation_factor_is_rate_invariant_and_cache_warms_up() {
    // a finite migration barrier makes the cache key temperature dependent
    let (mut diffuser, (l0vv_1, lss_1, _, _)) =
        tracer_lij(Crystal::fcc(1.0).unwrap(), 0.75, 1, 0.5, 1.0);
    assert_eq!(diffuser.cache().len(), 1);
    let f0_1 = lss_1[(0, 0)] / l0vv_1[(0, 0)];

    let n0 = diffuser.omega0_network().len();
    let data = diffuser
        .tracer_pre_ene(&[1.0], &[0.0], &vec![1.0; n0], &vec![0.5; n0])
        .unwrap();
    let bf_cold = pre_ene_to_beta_free(0.5, &data);
    let (l0vv_2, lss_2, _, _) = diffuser.lij(&bf_cold).unwrap();
    assert_eq!(diffuser.cache().len(), 2);
    // rates drop but the correlation factor is scale free
    assert!(l0vv_2[(0, 0)] < l0vv_1[(0, 0)]);
    let f0_2 = lss_2[(0, 0)] / l0vv_2[(0, 0)];
    assert_approx_eq!(f64, f0_1, f0_2, epsilon = 1e-6);

    // a repeated temperature hits the cache instead of growing it
    let bf_hot = pre_ene_to_beta_free(1.0, &data);
    diffuser.lij(&bf_hot).unwrap();
    assert_eq!(diffuser.cache().len(), 2);
}

#[test]
fn diffuser_roundtrips_through_the_blob_store() {
    let (mut diffuser, tensors) = tracer_lij(Crystal::fcc(1.0).unwrap(), 0.75, 1, 0.0, 1.0);
    let mut blob = Vec::new();
    diffuser.write(&mut blob).unwrap();
    let mut restored: VacancyMediated = VacancyMediated::read(blob.as_slice()).unwrap();

    assert_eq!(
        diffuser.interactlist().unwrap(),
        restored.interactlist().unwrap()
    );
    let (pairs, jumptypes) = diffuser.omegalist(1).unwrap();
    let (rpairs, rjumptypes) = restored.omegalist(1).unwrap();
    assert_eq!(pairs, rpairs);
    assert_eq!(jumptypes, rjumptypes);

    // the Green-function cache travels with the blob, so the restored
    // diffuser reproduces the tensors without re-evaluating the oracle
    assert_eq!(restored.cache().len(), 1);
    let n0 = restored.omega0_network().len();
    let data = restored
        .tracer_pre_ene(&[1.0], &[0.0], &vec![1.0; n0], &vec![0.0; n0])
        .unwrap();
    let bf = pre_ene_to_beta_free(1.0, &data);
    let rtensors = restored.lij(&bf).unwrap();
    assert!((tensors.0 - rtensors.0).norm() < 1e-12);
    assert!((tensors.1 - rtensors.1).norm() < 1e-12);
    assert!((tensors.2 - rtensors.2).norm() < 1e-12);
    assert!((tensors.3 - rtensors.3).norm() < 1e-12);

    // a foreign blob is rejected as the wrong type
    assert!(VacancyMediated::<stardiff::gf::KspaceGf>::read(&b"not a diffuser blob"[..]).is_err());
}
