use std::fs;

use candle_core::Device;
use serde_json::Value;
use tempfile::tempdir;
use trainloop::{
    algorithms,
    backend::{LinearRegressor, Sgd, SyntheticRegression},
    Model, Profiler, SchedulerConfig, Trainer, TrainerBuilder, TrainingConfig,
};

const CONFIG: &str = r#"
[run]
seed = 11
max_duration = "2ep"
log_every_n_batches = 4

[optimizer]
learning_rate = 0.1

[scheduler]
strategy = "cosine_with_warmup"
warmup_steps = 2

[checkpoint]
directory = "checkpoints"
every_n_epochs = 1
max_keep = 1

[evaluation]
every_n_epochs = 1

[logging]
enable_stdout = false
metrics_file = "logs/metrics.jsonl"

[algorithms.gradient_clipping]
max_norm = 5.0

[data]
samples = 32
eval_samples = 8
features = 3
batch_size = 8
"#;

fn assemble(config: &TrainingConfig, profiler: Option<Profiler>) -> Trainer {
    let device = Device::Cpu;
    let data = &config.data;
    let train = SyntheticRegression::generate(data.samples, data.features, data.noise, 1, &device)
        .unwrap()
        .into_loader(data.batch_size, data.shuffle)
        .unwrap();
    let eval =
        SyntheticRegression::generate(data.eval_samples, data.features, data.noise, 1, &device)
            .unwrap()
            .into_loader(data.batch_size, false)
            .unwrap();

    let model = LinearRegressor::new(data.features, &device).unwrap();
    let vars = model.parameters().into_iter().map(|(_, var)| var).collect();
    let optimizer = Sgd::new(vars, config.optimizer.learning_rate).unwrap();
    let scheduler = SchedulerConfig::from_training_config(
        &config.scheduler,
        config.optimizer.learning_rate,
        8,
    )
    .unwrap()
    .build()
    .unwrap();

    let mut builder = TrainerBuilder::new(config.clone(), model, train)
        .optimizer(optimizer)
        .scheduler(scheduler)
        .eval_loader(eval)
        .algorithms(algorithms::from_config(&config.algorithms));
    if let Some(profiler) = profiler {
        builder = builder.observer(profiler);
    }
    builder.build().unwrap()
}

#[test]
fn smoke_training_checkpoint_resume() {
    let tmp = tempdir().expect("tempdir");
    let config_path = tmp.path().join("train.toml");
    fs::write(&config_path, CONFIG).unwrap();

    let config = TrainingConfig::from_path(&config_path).expect("config");
    let checkpoint_dir = tmp.path().join("checkpoints");
    assert_eq!(
        config.checkpoint.as_ref().map(|c| c.directory.clone()),
        Some(checkpoint_dir.clone())
    );

    let profiler = Profiler::new();
    let profile = profiler.handle();
    let mut trainer = assemble(&config, Some(profiler));
    trainer.fit().expect("fit");
    trainer.close().expect("close");

    let eval_losses = trainer.state().metric_trace("eval/loss");
    assert_eq!(eval_losses.len(), 2);
    assert!(eval_losses[1] < eval_losses[0], "{eval_losses:?}");

    let report = profile.report();
    assert_eq!(report.batches.count, 8);
    assert_eq!(report.sections.get("forward").map(|s| s.count), Some(8));

    let metrics = fs::read_to_string(tmp.path().join("logs/metrics.jsonl")).unwrap();
    let records: Vec<Value> = metrics
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(records[0].get("hyperparameters").is_some());
    let logged = |name: &str| {
        records
            .iter()
            .filter(|r| r["metrics"].get(name).is_some())
            .count()
    };
    assert_eq!(logged("loss/train"), 2);
    assert_eq!(logged("eval/loss"), 2);
    assert_eq!(logged("grad_norm"), 8);

    let remaining: Vec<String> = fs::read_dir(&checkpoint_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["ep000002-ba000000000008".to_string()]);

    let mut resumed = assemble(&config, None);
    let descriptor = resumed
        .resume_from_latest()
        .expect("resume")
        .expect("checkpoint present");
    assert_eq!(descriptor.manifest.timestamp.batch, 8);
    assert_eq!(
        resumed.state().metric_trace("loss/train"),
        trainer.state().metric_trace("loss/train")
    );
    resumed.fit().expect("nothing left to train");
    assert_eq!(resumed.timestamp().batch, 8);
}
