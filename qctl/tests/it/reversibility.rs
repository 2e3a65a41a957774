use qctl::{
    disc::{
        cbq::{CbqClassRequest, CbqDiscipline, CbqOptions},
        hfsc::HfscClassRequest,
    },
    ClassId, ClassParams, ClassRequest, Error, InterfaceConfig, MemoryDevice,
};
use qctl_curve::{GenServiceCurve, ServiceCurve};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{hfsc_interface, params, State};

const STEPS: usize = 500;

fn random_curve(rng: &mut StdRng) -> ServiceCurve {
    let m2 = rng.gen_range(0..=3_000_000);
    if rng.gen_bool(0.5) {
        return ServiceCurve::linear(m2);
    }
    let d = rng.gen_range(1..=50);
    // Either concave, or convex with a flat start.
    let m1 = if rng.gen_bool(0.5) { rng.gen_range(m2..=6_000_000) } else { 0 };
    ServiceCurve::new(m1, d, m2)
}

fn random_request(rng: &mut StdRng) -> HfscClassRequest {
    loop {
        let rsc = if rng.gen_bool(0.3) { ServiceCurve::NULL } else { random_curve(rng) };
        let fsc = random_curve(rng);
        if !(rsc.is_null() && fsc.is_null()) {
            return HfscClassRequest::new(rsc, fsc);
        }
    }
}

fn children_sum(state: &State, children: &[ClassId]) -> (GenServiceCurve, GenServiceCurve) {
    let mut rsc = GenServiceCurve::new();
    let mut fsc = GenServiceCurve::new();
    for &child in children {
        if let ClassParams::Hfsc(class) = params(state, child) {
            rsc.add(&class.request.rsc);
            fsc.add(&class.request.fsc);
        }
    }
    (rsc, fsc)
}

#[test]
fn hfsc_admission_is_reversible() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let initial = params(&state, root);

    let mut live = Vec::new();
    for step in 0..STEPS {
        if live.is_empty() || rng.gen_bool(0.6) {
            let before = params(&state, root);
            let request = random_request(&mut rng);
            let name = format!("c{step}");
            match state.add_class(em0, Some(root), &name, ClassRequest::Hfsc(request)) {
                Ok(id) => live.push(id),
                Err(e) => {
                    assert!(matches!(e, Error::AdmissionNoBandwidth(_)), "{e}");
                    assert_eq!(params(&state, root), before);
                }
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            state.delete_class(live.swap_remove(idx)).unwrap();
        }

        let ClassParams::Hfsc(parent) = params(&state, root) else { panic!("root is hfsc") };
        let (rsc, fsc) = children_sum(&state, &live);
        assert_eq!(parent.gen_rsc, rsc, "step {step}");
        assert_eq!(parent.gen_fsc, fsc, "step {step}");
        assert!(parent.fits_children());
    }

    live.shuffle(&mut rng);
    for id in live {
        state.delete_class(id).unwrap();
    }
    assert_eq!(params(&state, root), initial);
}

fn allocated(state: &State, id: ClassId) -> u64 {
    match params(state, id) {
        ClassParams::Cbq(class) => class.allocated,
        other => panic!("not a cbq class: {other:?}"),
    }
}

#[test]
fn cbq_ledger_is_reversible() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut state = State::new(MemoryDevice::new());
    let em0 = state
        .add_interface(
            "em0",
            InterfaceConfig::new(100_000_000),
            Box::new(CbqDiscipline::new(CbqOptions::default())),
        )
        .unwrap();
    let root = state
        .add_class(em0, None, "root", ClassRequest::Cbq(CbqClassRequest::new(100_000_000)))
        .unwrap();
    let initial = params(&state, root);

    let mut live: Vec<ClassId> = Vec::new();
    for step in 0..STEPS {
        if live.is_empty() || rng.gen_bool(0.6) {
            let parent = *live.choose(&mut rng).filter(|_| rng.gen_bool(0.4)).unwrap_or(&root);
            let before = allocated(&state, parent);
            let bandwidth = rng.gen_range(1..=20_000_000);
            let name = format!("c{step}");
            let request = ClassRequest::Cbq(CbqClassRequest::new(bandwidth));
            match state.add_class(em0, Some(parent), &name, request) {
                Ok(id) => {
                    live.push(id);
                    assert_eq!(allocated(&state, parent), before + bandwidth);
                }
                Err(e) => {
                    assert!(matches!(e, Error::AdmissionNoBandwidth(_)), "{e}");
                    assert_eq!(allocated(&state, parent), before);
                }
            }
        } else {
            let leaves: Vec<_> = live
                .iter()
                .copied()
                .filter(|id| state.class(*id).is_some_and(|c| c.is_leaf()))
                .collect();
            let victim = *leaves.choose(&mut rng).unwrap();
            state.delete_class(victim).unwrap();
            live.retain(|id| *id != victim);
        }
    }

    while let Some(leaf) =
        live.iter().copied().find(|id| state.class(*id).is_some_and(|c| c.is_leaf()))
    {
        state.delete_class(leaf).unwrap();
        live.retain(|id| *id != leaf);
    }
    assert_eq!(params(&state, root), initial);
}
