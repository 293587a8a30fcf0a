/// Demonstration of both forecasting engines on synthetic check-ins
///
/// This example shows how to:
/// 1. Load engine configuration (falling back to defaults)
/// 2. Train the PLRNN and the KalmanFormer on the same history
/// 3. Forecast, inspect the causal graph and simulate an intervention
/// 4. Explain the KalmanFormer estimate through its attention
use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use cogstate_core::{
    log_forecast, log_training_run, EngineConfig, InterventionKind, KalmanFormerEngine,
    PlrnnEngine, StateObservation,
};

fn synthetic_history(days: i64) -> Vec<StateObservation> {
    let start = Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap();
    (0..days * 4)
        .map(|i| {
            let t = i as f64;
            // Mood drifts down over the second half while arousal oscillates daily
            let drift = (t - (days * 2) as f64).max(0.0) * -0.004;
            StateObservation::from_affect_scores(
                0.2 + drift + 0.05 * (t * 0.9).sin(),
                0.5 + 0.15 * (t * std::f64::consts::FRAC_PI_2).sin(),
                0.6,
                0.3 - drift,
                0.5 + 0.02 * (t * 0.4).cos(),
                start + Duration::hours(6 * i),
            )
        })
        .collect()
}

fn main() -> Result<()> {
    println!("=== Cognitive State Forecast Demo ===\n");

    let config = EngineConfig::load_from_file("config/engine.toml").unwrap_or_default();
    let history = synthetic_history(14);
    let (train, holdout) = history.split_at(history.len() - 8);
    println!("History: {} check-ins ({} held out)\n", history.len(), holdout.len());

    // PLRNN: train, forecast, causal structure
    println!("--- PLRNN ---");
    let mut plrnn = PlrnnEngine::new(config.plrnn.clone());
    plrnn.initialize()?;
    let mut result = plrnn.train_batch(&[train.to_vec()])?;
    for _ in 0..9 {
        result = plrnn.train_batch(&[train.to_vec()])?;
    }
    log_training_run("plrnn", 1, &result)?;
    println!("Training loss: {:.5} (converged: {})", result.loss, result.converged);
    println!("Holdout loss:  {:.5}", plrnn.evaluate(&[holdout.to_vec()])?);

    let state = plrnn.state_from_observation(&train[train.len() - 1])?;
    let forecast = plrnn.predict_default(&state, None)?;
    log_forecast("plrnn", &forecast)?;
    println!("12h mean:     {:?}", rounded(&forecast.mean));
    println!("12h variance: {:?}", rounded(&forecast.variance));
    for signal in &forecast.early_warnings {
        println!("  warning: {} ({}) strength {:.2}", signal.kind, signal.label, signal.strength);
    }

    let network = plrnn.extract_causal_network()?;
    println!(
        "Causal graph: {} edges, density {:.2}",
        network.edges.len(),
        network.metrics.density
    );
    let intervention =
        plrnn.simulate_intervention_by_name(&state, "arousal", InterventionKind::Decrease, 0.1)?;
    println!(
        "Decrease arousal: peak {:+.4} at step {}, lasting {} steps\n",
        intervention.peak_effect(),
        intervention.time_to_peak,
        intervention.duration
    );

    // KalmanFormer: filter the history, forecast, explain
    println!("--- KalmanFormer ---");
    let mut filter = KalmanFormerEngine::new(config.kalmanformer.clone());
    filter.initialize()?;
    let result = filter.train_batch(&[train.to_vec()])?;
    log_training_run("kalmanformer", 1, &result)?;
    println!("Training loss: {:.5}", result.loss);

    let mut filter_state = filter.initial_state(&train[0])?;
    for observation in &train[1..] {
        filter_state = filter.update(&filter_state, &observation.values, observation.timestamp)?;
    }
    let forecast = filter.predict(&filter_state, 12)?;
    log_forecast("kalmanformer", &forecast.prediction)?;
    println!("12h mean:      {:?}", rounded(&forecast.prediction.mean));
    println!("Kalman only:   {:?}", rounded(&forecast.kalman_only));
    println!("Encoder only:  {:?}", rounded(&forecast.transformer_only));
    println!("Confidence:    {:.3}", forecast.confidence);
    println!("Blend ratio:   {:.3}", filter_state.blend_ratio);

    let explanation = forecast.explanation;
    println!("Attention pattern: {}", explanation.pattern);
    for influence in &explanation.top_influences {
        println!(
            "  {} attention {:.3} (dominant: {})",
            influence.timestamp.format("%a %H:%M"),
            influence.attention,
            influence.label
        );
    }

    Ok(())
}

fn rounded(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| (v * 1000.0).round() / 1000.0).collect()
}
