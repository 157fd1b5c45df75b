mod common;

use std::sync::{Arc, Mutex};

use common::*;
use trainloop::{
    config::EarlyStoppingConfig, Algorithm, Event, Logger, MatchPurity, Observer, State, Time,
    Trace, TrainingError,
};

#[test]
fn repeated_runs_produce_identical_events_and_traces() {
    let run = || {
        let (recorder, log) = Recorder::new();
        let mut trainer = builder(config(Time::epochs(2)))
            .algorithm(BatchCounter { count: 0 })
            .observer(recorder)
            .build()
            .expect("build");
        trainer.fit().expect("fit");
        (records(&log), trainer.state().metric_trace("loss/train"))
    };

    let (first_log, first_losses) = run();
    let (second_log, second_losses) = run();
    assert_eq!(first_log, second_log);
    assert_eq!(first_losses, second_losses);
    assert_eq!(first_losses.len() as u64, 2 * BATCHES_PER_EPOCH);
}

#[test]
fn full_epoch_follows_the_canonical_event_order() {
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(config(Time::epochs(1)))
        .observer(recorder)
        .build()
        .expect("build");
    trainer.fit().expect("fit");

    let events = events(&log);
    assert_eq!(
        &events[..4],
        &[Event::Init, Event::FitStart, Event::EpochStart, Event::BatchStart]
    );
    assert_eq!(
        &events[3..17],
        &[
            Event::BatchStart,
            Event::BeforeDataloader,
            Event::AfterDataloader,
            Event::BeforeForward,
            Event::AfterForward,
            Event::BeforeLoss,
            Event::AfterLoss,
            Event::BeforeBackward,
            Event::AfterBackward,
            Event::BeforeOptimizerStep,
            Event::AfterOptimizerStep,
            Event::BatchEnd,
            Event::BatchStart,
            Event::BeforeDataloader,
        ]
    );
    assert_eq!(&events[events.len() - 2..], &[Event::EpochEnd, Event::FitEnd]);
    let batches = events.iter().filter(|e| **e == Event::BatchEnd).count();
    assert_eq!(batches as u64, BATCHES_PER_EPOCH);
    assert_eq!(trainer.timestamp().epoch, 1);
    assert_eq!(trainer.timestamp().batch, BATCHES_PER_EPOCH);
}

#[test]
fn algorithms_run_by_priority_then_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tagger = |name: &str, priority| Tagger {
        name: name.to_string(),
        priority,
        event: Event::FitStart,
        seen: Arc::clone(&seen),
    };
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(config(Time::batches(1)))
        .algorithm(tagger("b", Some(2)))
        .algorithm(tagger("a", Some(1)))
        .algorithm(tagger("first_default", None))
        .algorithm(tagger("second_default", None))
        .algorithm(tagger("early", Some(-5)))
        .observer(recorder)
        .build()
        .expect("build");

    let expected = vec!["early", "first_default", "second_default", "a", "b"];
    assert_eq!(trainer.engine().algorithm_order(), expected);

    trainer.fit().expect("fit");
    assert_eq!(*seen.lock().unwrap(), expected);

    let fit_start = records(&log)
        .into_iter()
        .find(|record| record.event == Event::FitStart)
        .expect("fit start recorded");
    let trace_order: Vec<String> = fit_start
        .traces
        .iter()
        .map(|trace| trace.algorithm.clone())
        .collect();
    assert_eq!(trace_order, expected);
    assert!(fit_start.traces.iter().all(|t| t.event == Event::FitStart));
}

#[test]
fn duplicate_algorithm_names_are_rejected() {
    let err = builder(config(Time::epochs(1)))
        .algorithm(BatchCounter { count: 0 })
        .algorithm(BatchCounter { count: 0 })
        .build()
        .err()
        .expect("duplicate must fail");
    assert!(err.is_contract_violation());
}

#[test]
fn forward_failure_skips_the_after_event_and_ends_the_run() {
    let (recorder, log) = Recorder::new();
    let mut trainer = builder_with_model(config(Time::epochs(1)), FlakyModel::new(3))
        .observer(recorder)
        .build()
        .expect("build");

    let err = trainer.fit().expect_err("forward failure is fatal");
    match &err {
        TrainingError::Numeric {
            operation,
            event,
            timestamp,
            ..
        } => {
            assert_eq!(*operation, "forward");
            assert_eq!(*event, Event::BeforeForward);
            assert_eq!(timestamp.batch, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let events = events(&log);
    assert_eq!(events.last(), Some(&Event::BeforeForward));
    let after_forward = events.iter().filter(|e| **e == Event::AfterForward).count();
    assert_eq!(after_forward, 2);
    assert!(!events.contains(&Event::FitEnd));

    assert!(trainer.engine().is_aborted());
    let again = trainer.fit().expect_err("aborted engine refuses events");
    assert!(again.is_contract_violation());
}

#[test]
fn algorithm_failure_names_the_algorithm_and_skips_the_after_event() {
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(config(Time::epochs(1)))
        .algorithm(FailAt {
            event: Event::BeforeLoss,
            batch: 4,
        })
        .observer(recorder)
        .build()
        .expect("build");

    let err = trainer.fit().expect_err("algorithm failure is fatal");
    match &err {
        TrainingError::Algorithm {
            algorithm,
            event,
            timestamp,
            ..
        } => {
            assert_eq!(algorithm, "fail_at");
            assert_eq!(*event, Event::BeforeLoss);
            assert_eq!(timestamp.batch, 4);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.event(), Some(Event::BeforeLoss));

    let records = records(&log);
    let last = records.last().expect("events recorded");
    assert_eq!(last.event, Event::AfterForward);
    assert_eq!(last.timestamp.batch, 4);
    assert!(!records
        .iter()
        .any(|r| r.event == Event::AfterLoss && r.timestamp.batch == 4));
}

struct FailingObserver;

impl Observer for FailingObserver {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_event(
        &mut self,
        event: Event,
        _state: &State,
        _traces: &[Trace],
    ) -> trainloop::Result<()> {
        if event == Event::EpochEnd {
            return Err(TrainingError::runtime("disk full"));
        }
        Ok(())
    }
}

#[test]
fn observer_failure_aborts_the_run() {
    let mut trainer = builder(config(Time::epochs(2)))
        .observer(FailingObserver)
        .build()
        .expect("build");

    let err = trainer.fit().expect_err("observer failure is fatal");
    match &err {
        TrainingError::Observer {
            observer, event, ..
        } => {
            assert_eq!(observer, "failing");
            assert_eq!(*event, Event::EpochEnd);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(trainer.engine().is_aborted());
    assert_eq!(trainer.timestamp().epoch, 0);
}

/// Writes the model weights from inside `matches`.
struct ImpureMatcher;

impl Algorithm for ImpureMatcher {
    fn name(&self) -> &str {
        "impure"
    }

    fn matches(&self, _event: Event, state: &State) -> bool {
        for (_, var) in state.model.parameters() {
            let ones = var.ones_like().expect("ones");
            var.set(&ones).expect("set");
        }
        false
    }

    fn apply(
        &mut self,
        _event: Event,
        _state: &mut State,
        _logger: &mut Logger,
    ) -> trainloop::Result<Trace> {
        Ok(Trace::new("unreachable"))
    }
}

#[test]
fn impure_match_is_fatal_when_checking_is_strict() {
    let mut strict = config(Time::batches(2));
    strict.engine.match_purity = MatchPurity::Error;
    let err = builder(strict)
        .algorithm(ImpureMatcher)
        .build()
        .err()
        .expect("mutation inside matches must be reported");
    assert!(err.is_contract_violation());
    assert!(err.to_string().contains("impure"));
}

#[test]
fn impure_match_only_warns_in_warn_mode() {
    let mut lenient = config(Time::batches(2));
    lenient.engine.match_purity = MatchPurity::Warn;
    let mut trainer = builder(lenient)
        .algorithm(ImpureMatcher)
        .build()
        .expect("warn mode keeps running");
    trainer.fit().expect("fit");
    assert_eq!(trainer.timestamp().batch, 2);
}

/// Halves the schedule at the start of epoch 2.
struct HalveLearningRate;

impl Algorithm for HalveLearningRate {
    fn name(&self) -> &str {
        "halve_lr"
    }

    fn priority(&self) -> Option<i32> {
        Some(0)
    }

    fn matches(&self, event: Event, state: &State) -> bool {
        event == Event::EpochStart && state.timestamp.epoch == 2
    }

    fn apply(
        &mut self,
        _event: Event,
        state: &mut State,
        _logger: &mut Logger,
    ) -> trainloop::Result<Trace> {
        state.scale_learning_rates(0.5);
        Ok(Trace::new("halved learning rate").touched("schedulers"))
    }
}

/// Records the scheduler's rate at every epoch start and at the end of the fit.
struct RecordLearningRate;

impl Algorithm for RecordLearningRate {
    fn name(&self) -> &str {
        "record_lr"
    }

    fn priority(&self) -> Option<i32> {
        Some(10)
    }

    fn matches(&self, event: Event, _state: &State) -> bool {
        matches!(event, Event::EpochStart | Event::FitEnd)
    }

    fn apply(
        &mut self,
        _event: Event,
        state: &mut State,
        _logger: &mut Logger,
    ) -> trainloop::Result<Trace> {
        let lr = state
            .schedulers
            .first()
            .map(|scheduler| scheduler.learning_rate())
            .ok_or_else(|| TrainingError::runtime("no scheduler"))?;
        state.record_metric("lr", lr);
        Ok(Trace::new(format!("lr {lr}")).touched("metrics"))
    }
}

#[test]
fn later_priority_sees_learning_rate_change_from_earlier_priority() {
    let mut trainer = builder(config(Time::epochs(3)))
        .algorithm(RecordLearningRate)
        .algorithm(HalveLearningRate)
        .build()
        .expect("build");
    trainer.fit().expect("fit");

    assert_eq!(trainer.state().metric_trace("lr"), vec![0.1, 0.1, 0.05, 0.05]);
    let optimizer_lr = trainer.state().learning_rate().expect("optimizer");
    assert!((optimizer_lr - 0.05).abs() < 1e-12);
}

#[test]
fn early_stopping_ends_the_fit_between_epochs() {
    let mut cfg = config(Time::epochs(10));
    cfg.algorithms.early_stopping = Some(EarlyStoppingConfig {
        metric: "loss/train".to_string(),
        patience: 1,
        min_delta: 1e9,
    });
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(cfg.clone())
        .algorithms(trainloop::algorithms::from_config(&cfg.algorithms))
        .observer(recorder)
        .build()
        .expect("build");
    trainer.fit().expect("fit");

    assert_eq!(trainer.timestamp().epoch, 2);
    let events = events(&log);
    assert_eq!(events.last(), Some(&Event::FitEnd));
    assert_eq!(events.iter().filter(|e| **e == Event::EpochEnd).count(), 2);
}

#[test]
fn early_stopping_on_eval_loss_sees_the_epoch_evaluation() {
    let mut cfg = config(Time::epochs(5));
    cfg.evaluation.every_n_epochs = Some(1);
    cfg.algorithms.early_stopping = Some(EarlyStoppingConfig {
        metric: "eval/loss".to_string(),
        patience: 1,
        min_delta: 1e9,
    });
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(cfg.clone())
        .eval_loader(eval_loader())
        .algorithms(trainloop::algorithms::from_config(&cfg.algorithms))
        .observer(recorder)
        .build()
        .expect("build");
    trainer.fit().expect("fit");

    assert_eq!(trainer.timestamp().epoch, 2);
    assert_eq!(trainer.state().metric_trace("eval/loss").len(), 2);

    let records = records(&log);
    let eval_end = records
        .iter()
        .position(|r| r.event == Event::EvalEnd)
        .expect("evaluation ran");
    let epoch_end = records
        .iter()
        .position(|r| r.event == Event::EpochEnd)
        .expect("epoch ended");
    assert!(eval_end < epoch_end);

    let last_epoch_end = records
        .iter()
        .rev()
        .find(|r| r.event == Event::EpochEnd)
        .expect("epoch ended");
    assert!(last_epoch_end
        .traces
        .iter()
        .any(|trace| trace.summary.contains("stopping")));
}

#[test]
fn batch_duration_stops_mid_epoch() {
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(config(Time::batches(15)))
        .observer(recorder)
        .build()
        .expect("build");
    trainer.fit().expect("fit");

    let ts = trainer.timestamp();
    assert_eq!((ts.epoch, ts.batch, ts.batch_in_epoch), (1, 15, 5));
    assert_eq!(ts.sample, 15 * BATCH_SIZE as u64);
    let events = events(&log);
    assert_eq!(events.last(), Some(&Event::FitEnd));
    assert_eq!(events.iter().filter(|e| **e == Event::EpochEnd).count(), 1);
}

#[test]
fn shutdown_callback_is_checked_between_batches() {
    let mut trainer = builder(config(Time::epochs(5)))
        .build()
        .expect("build");
    trainer
        .fit_with_shutdown(|ts| ts.batch >= 3)
        .expect("fit");
    assert_eq!(trainer.timestamp().batch, 3);
}

#[test]
fn evaluation_runs_in_inference_mode_and_records_loss() {
    let mut cfg = config(Time::epochs(1));
    cfg.evaluation.every_n_epochs = Some(1);
    cfg.evaluation.max_batches = Some(2);
    let (recorder, log) = Recorder::new();
    let mut trainer = builder(cfg)
        .eval_loader(loader())
        .observer(recorder)
        .build()
        .expect("build");
    trainer.fit().expect("fit");

    let events = events(&log);
    let eval_start = events
        .iter()
        .position(|e| *e == Event::EvalStart)
        .expect("evaluation ran");
    assert_eq!(
        &events[eval_start..eval_start + 6],
        &[
            Event::EvalStart,
            Event::EvalBatchStart,
            Event::EvalBeforeForward,
            Event::EvalAfterForward,
            Event::EvalBatchEnd,
            Event::EvalBatchStart,
        ]
    );
    assert_eq!(
        events.iter().filter(|e| **e == Event::EvalBatchEnd).count(),
        2
    );
    assert!(trainer.state().latest_metric("eval/loss").is_some());
    assert!(trainer.state().model.is_training());
}
