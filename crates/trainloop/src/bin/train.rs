use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::Device;
use clap::Parser;
use serde_json::{Map, Number, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trainloop::{
    algorithms,
    backend::{LinearRegressor, Sgd, SyntheticRegression},
    trainer::EVAL_LOSS_METRIC,
    DataLoader, Model, Profiler, SchedulerConfig, TimeUnit, TracingObserver, TrainerBuilder,
    TrainingConfig, TrainingError,
};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Event-driven training loop CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,

    #[arg(
        long,
        value_name = "NAME",
        conflicts_with = "resume",
        help = "Download checkpoint NAME from the remote store and resume from it"
    )]
    resume_remote: Option<String>,

    #[arg(long, help = "Time each batch section and log a summary at exit")]
    profile: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let device = Device::Cpu;
    let data = &config.data;
    let train_loader = SyntheticRegression::generate(
        data.samples,
        data.features,
        data.noise,
        config.run.seed,
        &device,
    )?
    .into_loader(data.batch_size, data.shuffle)?;
    let eval_loader = SyntheticRegression::generate(
        data.eval_samples,
        data.features,
        data.noise,
        config.run.seed.wrapping_add(1),
        &device,
    )?
    .into_loader(data.batch_size, false)?;

    let model = LinearRegressor::new(data.features, &device)?;
    let vars = model
        .parameters()
        .into_iter()
        .map(|(_, var)| var)
        .collect();
    let optimizer = Sgd::new(vars, config.optimizer.learning_rate)?;

    let total_steps = total_scheduler_steps(&config, &train_loader);
    let scheduler = SchedulerConfig::from_training_config(
        &config.scheduler,
        config.optimizer.learning_rate,
        total_steps,
    )?
    .build()?;

    let profiler = Profiler::new();
    let profile_handle = profiler.handle();

    let mut builder = TrainerBuilder::new(config.clone(), model, train_loader)
        .optimizer(optimizer)
        .scheduler(scheduler)
        .eval_loader(eval_loader)
        .algorithms(algorithms::from_config(&config.algorithms))
        .observer(TracingObserver::new());
    if args.profile {
        builder = builder.observer(profiler);
    }
    let mut trainer = builder.build()?;

    if args.resume {
        if let Some(descriptor) = trainer.resume_from_latest()? {
            println!(
                "resumed from checkpoint {} (batch {})",
                descriptor.directory.display(),
                descriptor.manifest.timestamp.batch
            );
        }
    } else if let Some(name) = args.resume_remote.as_deref() {
        let descriptor = trainer.resume_from_remote(name)?;
        println!(
            "resumed from remote checkpoint {} (batch {})",
            descriptor.name(),
            descriptor.manifest.timestamp.batch
        );
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let outcome = trainer.fit_with_shutdown(|_| shutdown_flag.load(Ordering::Relaxed));
    trainer.close()?;
    outcome?;

    if args.profile {
        let report = profile_handle.report();
        info!(
            batches = report.batches.count,
            mean_batch_ms = report.batches.mean().as_secs_f64() * 1e3,
            "profile summary"
        );
    }
    if let Some(loss) = trainer.state().latest_metric(EVAL_LOSS_METRIC) {
        println!("final eval loss {loss:.6}");
    }

    Ok(())
}

fn total_scheduler_steps(config: &TrainingConfig, loader: &dyn DataLoader) -> u64 {
    if let Some(total) = config.scheduler.total_steps {
        return total;
    }
    let duration = config.run.max_duration;
    let per_epoch = loader.batches_per_epoch() as u64;
    let batch_size = config.data.batch_size.max(1) as u64;
    let steps = match duration.unit {
        TimeUnit::Epoch => duration.value * per_epoch,
        TimeUnit::Batch => duration.value,
        TimeUnit::Sample | TimeUnit::Token => duration.value.div_ceil(batch_size),
    };
    steps.max(1)
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Assigns `new_value` at a dot-separated path such as `run.max_duration`,
/// creating intermediate objects as needed.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "invalid override path '{path}'"
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };

    let mut current = value;
    for segment in parents {
        current = object_mut(current, segment)?
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    object_mut(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn object_mut<'a>(
    value: &'a mut Value,
    segment: &str,
) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{segment}' points into a non-object value"
        ))
    })
}
