use std::path::Path;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sleepnet::{
    AttackParams, BurnBackend, GradientAttack, ModelBackend, Pipeline, PipelineConfig, SplitKind,
    TargetKind,
};

type Backend = Autodiff<NdArray<f32>>;

const CONFIG_FILE: &str = "sleepnet.json";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = PipelineConfig::load_or_default(Path::new(CONFIG_FILE))
        .with_context(|| format!("loading {CONFIG_FILE}"))?;

    // Positional arguments replace the configured target list.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        config.targets = args
            .iter()
            .map(|a| a.parse::<TargetKind>())
            .collect::<sleepnet::Result<_>>()?;
    }

    info!(
        backend = std::any::type_name::<Backend>(),
        dataset = %config.dataset_root.display(),
        artifacts = %config.artifact_dir.display(),
        targets = ?config.targets,
        attacks = ?config.attacks,
        augment = config.augment,
        "starting pipeline"
    );

    let backend = BurnBackend::<Backend>::new(Default::default());
    let attacker = GradientAttack::new(config.attack_batch_size, config.seed);
    let targets = config.targets.clone();
    let pipeline = Pipeline::new(backend, attacker, config)?;

    for target in targets {
        run_target(&pipeline, target).with_context(|| format!("pipeline run for target '{target}'"))?;
    }

    info!("all targets finished");
    Ok(())
}

fn run_target(pipeline: &Pipeline<BurnBackend<Backend>, GradientAttack>, target: TargetKind) -> Result<()> {
    let config = pipeline.config();

    let training = pipeline.run_training(target, config.augment)?;
    println!("{}", training.history);
    info!(
        history = %pipeline.store().history_path(target).display(),
        weights = %training.weights_path.display(),
        "training artifacts written"
    );

    let model = pipeline.backend().load(pipeline.store(), target)?;
    println!("{}", model.config.summary());

    let table = pipeline.run_batch_prediction(target, SplitKind::Test)?;
    println!("{}", table.confusion);
    println!("{}", table.report);

    let evaluation = pipeline.run_evaluation(target, SplitKind::Validation)?;
    println!("{}", evaluation.metrics);
    println!("{}", evaluation.report);

    for &method in &config.attacks {
        let params = AttackParams::for_method(method);
        let round = pipeline.run_adversarial_round(target, &params)?;
        println!(
            "{method}: clean accuracy {:.4}, adversarial accuracy {:.4}, after retraining {:.4}",
            round.clean.accuracy, round.undefended_accuracy, round.defended_accuracy
        );
        println!("{}", round.retrain_history);
    }
    Ok(())
}
