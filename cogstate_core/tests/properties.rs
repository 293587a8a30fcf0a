use chrono::{Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cogstate_core::kalmanformer::compute_attention_weights;
use cogstate_core::linalg::{mat_inverse, mat_mul, softmax, Matrix};
use cogstate_core::{
    detect_early_warnings, Connectivity, InterventionKind, KalmanFormerConfig,
    KalmanFormerEngine, LatentState, PlrnnConfig, PlrnnEngine, StateObservation, WarningKind,
};

fn plrnn(config: PlrnnConfig) -> PlrnnEngine {
    let mut engine = PlrnnEngine::new(config);
    engine.initialize().expect("valid config");
    engine
}

fn kalmanformer() -> KalmanFormerEngine {
    let mut engine = KalmanFormerEngine::new(KalmanFormerConfig {
        embed_dim: 16,
        num_heads: 4,
        context_window: 8,
        ..KalmanFormerConfig::default()
    });
    engine.initialize().expect("valid config");
    engine
}

fn random_state(rng: &mut StdRng, dim: usize) -> LatentState {
    let values = (0..dim).map(|_| rng.gen_range(-1.5..1.5)).collect();
    LatentState::from_values(values, rng.gen_range(0.0..0.5), Utc::now())
}

#[test]
fn forward_preserves_dimensionality() {
    let mut rng = StdRng::seed_from_u64(7);
    for (dim, connectivity) in [
        (3, Connectivity::Dense),
        (5, Connectivity::Dense),
        (5, Connectivity::Dendritic),
        (8, Connectivity::Dendritic),
    ] {
        let engine = plrnn(PlrnnConfig {
            latent_dim: dim,
            connectivity,
            ..PlrnnConfig::default()
        });
        for _ in 0..10 {
            let state = random_state(&mut rng, dim);
            let next = engine.forward(&state, None).unwrap();
            assert!(next.is_consistent(dim));
        }
    }
}

#[test]
fn update_preserves_dimensionality() {
    let engine = kalmanformer();
    let mut rng = StdRng::seed_from_u64(8);
    let start = Utc.with_ymd_and_hms(2024, 2, 1, 7, 30, 0).unwrap();
    let first = StateObservation::new(vec![0.5; 5], start);
    let mut state = engine.initial_state(&first).unwrap();
    for t in 1..20 {
        let observation: Vec<f64> = (0..5).map(|_| rng.gen_range(0.0..1.0)).collect();
        let timestamp = start + Duration::minutes(rng.gen_range(30..600) * t);
        state = engine.update(&state, &observation, timestamp).unwrap();
        assert_eq!(state.estimate.state.len(), 5);
        assert_eq!(state.estimate.covariance.shape(), (5, 5));
        assert_eq!(engine.to_observation(&state).unwrap().dim(), 5);
        assert!(state.window.len() <= 8);
    }
}

#[test]
fn uncertainty_never_decreases_nor_exceeds_ceiling() {
    let engine = plrnn(PlrnnConfig::default());
    let mut rng = StdRng::seed_from_u64(21);
    for _ in 0..5 {
        let mut state = random_state(&mut rng, 5);
        for _ in 0..60 {
            let next = engine.forward(&state, None).unwrap();
            for (before, after) in state.uncertainty.iter().zip(&next.uncertainty) {
                assert!(after >= before);
                assert!(*after <= 1.0);
            }
            state = next;
        }
    }
}

#[test]
fn load_then_get_weights_returns_the_same_values() {
    let source = plrnn(PlrnnConfig {
        connectivity: Connectivity::Dendritic,
        ..PlrnnConfig::default()
    });
    let weights = source.weights().unwrap().clone();

    let mut engine = PlrnnEngine::new(PlrnnConfig::default());
    engine.load_weights(weights.clone()).unwrap();
    assert_eq!(engine.weights().unwrap(), &weights);
    assert_eq!(engine.weights().unwrap(), &weights);
}

#[test]
fn inverse_round_trip_and_singular_fallback() {
    let mut rng = StdRng::seed_from_u64(3);
    for dim in [2, 5, 8] {
        let m = Matrix::from_fn(dim, dim, |r, c| {
            let noise = rng.gen_range(-0.2..0.2);
            if r == c {
                2.0 + noise
            } else {
                noise
            }
        });
        let product = mat_mul(&m, &mat_inverse(&m));
        let identity = Matrix::identity(dim);
        for (a, b) in product.iter().zip(identity.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    let singular = Matrix::from_rows(&[vec![1.0, 2.0], vec![2.0, 4.0]]).unwrap();
    assert_eq!(mat_inverse(&singular), Matrix::identity(2));
}

#[test]
fn attention_rows_stay_normalized_for_huge_equal_scores() {
    let rows = compute_attention_weights(&vec![vec![1e200; 4]; 3], &vec![vec![1e200; 4]; 5], 1.0);
    for row in rows {
        assert!(row.iter().all(|w| w.is_finite()));
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
    let probs = softmax(&[f64::MAX, f64::MAX, f64::MAX]);
    assert!(probs.iter().all(|p| (p - 1.0 / 3.0).abs() < 1e-12));
}

#[test]
fn early_warnings_need_two_full_windows() {
    let mut rng = StdRng::seed_from_u64(5);
    for window in 2..12 {
        for len in 0..2 * window {
            let history: Vec<Vec<f64>> = (0..len)
                .map(|_| (0..5).map(|_| rng.gen_range(0.0..1.0)).collect())
                .collect();
            assert!(detect_early_warnings(&history, window, 1.0).is_empty());
        }
    }
}

#[test]
fn rising_autocorrelation_is_reported() {
    let window = 20;
    let history: Vec<Vec<f64>> = (0..2 * window)
        .map(|t| {
            let first = if t < window {
                0.5 + if t % 2 == 0 { 0.1 } else { -0.1 }
            } else {
                (t - window) as f64 / window as f64
            };
            vec![first, 0.5, 0.5, 0.5, 0.5]
        })
        .collect();
    let signals = detect_early_warnings(&history, window, 1.0);
    assert!(signals
        .iter()
        .any(|s| s.kind == WarningKind::Autocorrelation && s.dimension == Some(0)));
}

#[test]
fn increase_and_decrease_have_opposite_effects() {
    let engine = plrnn(PlrnnConfig::default());
    let state = LatentState::from_values(vec![0.5; 5], 0.1, Utc::now());
    for target in 0..5 {
        let up = engine
            .simulate_intervention(&state, target, InterventionKind::Increase, 0.1)
            .unwrap();
        let down = engine
            .simulate_intervention(&state, target, InterventionKind::Decrease, 0.1)
            .unwrap();
        let step = up.time_to_peak - 1;
        assert!(up.effects[step][target] > 0.0);
        assert!(down.effects[step][target] < 0.0);
    }
}

#[test]
fn linear_dynamics_make_interventions_antisymmetric() {
    let mut engine = plrnn(PlrnnConfig::default());
    let mut weights = engine.weights().unwrap().clone();
    weights.recurrent = Matrix::zeros(5, 5);
    engine.load_weights(weights).unwrap();

    let state = LatentState::from_values(vec![0.3; 5], 0.1, Utc::now());
    let up = engine
        .simulate_intervention(&state, 2, InterventionKind::Increase, 0.2)
        .unwrap();
    let down = engine
        .simulate_intervention(&state, 2, InterventionKind::Decrease, 0.2)
        .unwrap();
    assert!((up.peak_effect() + down.peak_effect()).abs() < 1e-9);
}
