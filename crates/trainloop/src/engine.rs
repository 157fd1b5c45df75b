//! Algorithm registry and event dispatch.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::{
    algorithm::{Algorithm, Trace},
    event::{Event, EventSequencer},
    logging::Logger,
    observer::Observer,
    state::State,
    Result, TrainingError,
};

/// What the engine does when `matches` changes the state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPurity {
    #[default]
    Off,
    Warn,
    Error,
}

/// Runs algorithms and observers for each lifecycle event.
///
/// Algorithms execute in ascending priority, ties in registration order.
/// Observers run afterwards in registration order. The registry is frozen
/// once `INIT` has been dispatched, and any failed dispatch poisons the
/// engine so that no further events run.
pub struct Engine {
    algorithms: Vec<Box<dyn Algorithm>>,
    observers: Vec<Box<dyn Observer>>,
    logger: Logger,
    sequencer: EventSequencer,
    match_purity: MatchPurity,
    aborted: Option<String>,
    closed: bool,
}

impl Engine {
    pub fn new(logger: Logger) -> Self {
        Self {
            algorithms: Vec::new(),
            observers: Vec::new(),
            logger,
            sequencer: EventSequencer::default(),
            match_purity: MatchPurity::Off,
            aborted: None,
            closed: false,
        }
    }

    pub fn with_match_purity(mut self, purity: MatchPurity) -> Self {
        self.match_purity = purity;
        self
    }

    pub fn register_algorithm(&mut self, algorithm: Box<dyn Algorithm>) -> Result<()> {
        self.ensure_open_registry("algorithm", algorithm.name())?;
        if self
            .algorithms
            .iter()
            .any(|existing| existing.name() == algorithm.name())
        {
            return Err(TrainingError::contract(format!(
                "algorithm `{}` is already registered",
                algorithm.name()
            )));
        }
        self.algorithms.push(algorithm);
        self.algorithms
            .sort_by_key(|algorithm| algorithm.priority().unwrap_or(0));
        Ok(())
    }

    pub fn register_observer(&mut self, observer: Box<dyn Observer>) -> Result<()> {
        self.ensure_open_registry("observer", observer.name())?;
        self.observers.push(observer);
        Ok(())
    }

    fn ensure_open_registry(&self, kind: &str, name: &str) -> Result<()> {
        if self.sequencer.initialized() {
            return Err(TrainingError::contract(format!(
                "cannot register {kind} `{name}` after init"
            )));
        }
        Ok(())
    }

    /// Names in execution order.
    pub fn algorithm_order(&self) -> Vec<String> {
        self.algorithms
            .iter()
            .map(|algorithm| algorithm.name().to_string())
            .collect()
    }

    pub fn logger_mut(&mut self) -> &mut Logger {
        &mut self.logger
    }

    pub fn last_event(&self) -> Option<Event> {
        self.sequencer.last()
    }

    pub fn is_initialized(&self) -> bool {
        self.sequencer.initialized()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Refuses every further event. Used when a numeric step fails between a
    /// `Before*` event and its `After*`.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.aborted.is_none() {
            self.aborted = Some(reason.into());
        }
    }

    pub fn run_event(&mut self, event: Event, state: &mut State) -> Result<Vec<Trace>> {
        if let Some(reason) = &self.aborted {
            return Err(TrainingError::contract(format!(
                "{event} dispatched after the run was aborted ({reason})"
            )));
        }
        if self.closed {
            return Err(TrainingError::contract(format!(
                "{event} dispatched after the engine was closed"
            )));
        }
        if let Err(err) = self.sequencer.check(event) {
            self.abort(err.to_string());
            return Err(err);
        }

        match self.dispatch(event, state) {
            Ok(traces) => {
                self.sequencer.commit(event);
                Ok(traces)
            }
            Err(err) => {
                error!(%event, error = %err, "event dispatch failed; aborting run");
                self.abort(err.to_string());
                Err(err)
            }
        }
    }

    fn dispatch(&mut self, event: Event, state: &mut State) -> Result<Vec<Trace>> {
        let timestamp = state.timestamp;
        let mut traces = Vec::new();

        for algorithm in self.algorithms.iter_mut() {
            let matched = match self.match_purity {
                MatchPurity::Off => algorithm.matches(event, state),
                purity => {
                    let before = state.fingerprint()?;
                    let matched = algorithm.matches(event, state);
                    if state.fingerprint()? != before {
                        let message = format!(
                            "algorithm `{}` mutated the state inside `matches` during {event}",
                            algorithm.name()
                        );
                        if purity == MatchPurity::Error {
                            return Err(TrainingError::contract(message));
                        }
                        warn!(algorithm = algorithm.name(), %event, "{message}");
                    }
                    matched
                }
            };
            if !matched {
                continue;
            }

            let name = algorithm.name().to_string();
            let trace = algorithm
                .apply(event, state, &mut self.logger)
                .map_err(|source| TrainingError::Algorithm {
                    algorithm: name.clone(),
                    event,
                    timestamp,
                    source: Box::new(source),
                })?
                .stamp(&name, event);

            for attribute in &trace.touched {
                if !state.has_attribute(attribute) {
                    warn!(
                        algorithm = %name,
                        %event,
                        attribute = %attribute,
                        "trace names an unknown state attribute"
                    );
                }
            }
            traces.push(trace);
        }

        for observer in self.observers.iter_mut() {
            observer
                .on_event(event, state, &traces)
                .map_err(|source| TrainingError::Observer {
                    observer: observer.name().to_string(),
                    event,
                    timestamp,
                    source: Box::new(source),
                })?;
        }

        Ok(traces)
    }

    /// Persistent sub-state of every algorithm that has one, keyed by name.
    pub fn algorithm_state_dicts(&self) -> BTreeMap<String, Value> {
        self.algorithms
            .iter()
            .filter_map(|algorithm| {
                algorithm
                    .state_dict()
                    .map(|state| (algorithm.name().to_string(), state))
            })
            .collect()
    }

    /// Checks that `states` names exactly the algorithms with persistent state.
    pub(crate) fn check_algorithm_states(&self, states: &BTreeMap<String, Value>) -> Result<()> {
        let stateful: HashSet<&str> = self
            .algorithms
            .iter()
            .filter(|algorithm| algorithm.state_dict().is_some())
            .map(|algorithm| algorithm.name())
            .collect();
        for name in states.keys() {
            if !stateful.contains(name.as_str()) {
                return Err(TrainingError::contract(format!(
                    "checkpoint has state for algorithm `{name}` which is not registered or keeps no state"
                )));
            }
        }
        for name in stateful {
            if !states.contains_key(name) {
                return Err(TrainingError::contract(format!(
                    "checkpoint has no state for algorithm `{name}`"
                )));
            }
        }
        Ok(())
    }

    pub fn load_algorithm_state_dicts(
        &mut self,
        mut states: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.check_algorithm_states(&states)?;
        for algorithm in self.algorithms.iter_mut() {
            if let Some(state) = states.remove(algorithm.name()) {
                algorithm.load_state_dict(state)?;
            }
        }
        Ok(())
    }

    /// Closes observers and flushes the logger. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for observer in self.observers.iter_mut() {
            observer.close()?;
        }
        self.logger.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::LinearRegressor,
        time::Time,
    };
    use candle_core::Device;

    struct Named {
        name: &'static str,
        priority: Option<i32>,
    }

    impl Algorithm for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> Option<i32> {
            self.priority
        }

        fn matches(&self, event: Event, _state: &State) -> bool {
            event == Event::FitStart
        }

        fn apply(
            &mut self,
            _event: Event,
            _state: &mut State,
            _logger: &mut Logger,
        ) -> Result<Trace> {
            Ok(Trace::new(self.name).touched("metrics"))
        }
    }

    fn state() -> State {
        let model = LinearRegressor::new(2, &Device::Cpu).unwrap();
        State::new(Box::new(model), Time::epochs(1), 0)
    }

    #[test]
    fn orders_by_priority_then_registration() {
        let mut engine = Engine::new(Logger::new());
        for (name, priority) in [("c", Some(5)), ("a", None), ("b", Some(-1)), ("d", Some(0))] {
            engine
                .register_algorithm(Box::new(Named { name, priority }))
                .unwrap();
        }
        assert_eq!(engine.algorithm_order(), vec!["b", "a", "d", "c"]);

        let mut state = state();
        engine.run_event(Event::Init, &mut state).unwrap();
        let traces = engine.run_event(Event::FitStart, &mut state).unwrap();
        let ran: Vec<_> = traces.iter().map(|t| t.algorithm.as_str()).collect();
        assert_eq!(ran, vec!["b", "a", "d", "c"]);
        assert!(traces.iter().all(|t| t.event == Event::FitStart));
    }

    #[test]
    fn rejects_duplicate_names_and_late_registration() {
        let mut engine = Engine::new(Logger::new());
        engine
            .register_algorithm(Box::new(Named { name: "x", priority: None }))
            .unwrap();
        let err = engine
            .register_algorithm(Box::new(Named { name: "x", priority: Some(1) }))
            .unwrap_err();
        assert!(err.is_contract_violation());

        let mut state = state();
        engine.run_event(Event::Init, &mut state).unwrap();
        let err = engine
            .register_algorithm(Box::new(Named { name: "y", priority: None }))
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn illegal_order_poisons_the_engine() {
        let mut engine = Engine::new(Logger::new());
        let mut state = state();
        assert!(engine.run_event(Event::BatchStart, &mut state).is_err());
        assert!(engine.is_aborted());
        assert!(engine.run_event(Event::Init, &mut state).is_err());
    }
}
