//! Sequential and parallel process composites.

use crate::component::{CancelToken, ProcessComponent, ProcessListener, ProcessState};
use crate::error::{ProcessError, RollbackReason};
use std::sync::mpsc;
use tracing::{debug, warn};

/// Runs children in order; on any child failure, already-succeeded children
/// are compensated in reverse order.
pub struct SequentialProcess {
    name: String,
    children: Vec<Box<dyn ProcessComponent>>,
    listeners: Vec<Box<dyn ProcessListener>>,
    state: ProcessState,
}

impl SequentialProcess {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            listeners: Vec::new(),
            state: ProcessState::Ready,
        }
    }

    /// Append an atomic step.
    pub fn add_step(&mut self, step: impl crate::step::ProcessStep + 'static) -> &mut Self {
        self.children.push(Box::new(crate::step::StepUnit::new(step)));
        self
    }

    /// Append a nested component (e.g. a parallel composite).
    pub fn add_component(&mut self, component: impl ProcessComponent + 'static) -> &mut Self {
        self.children.push(Box::new(component));
        self
    }

    pub fn add_listener(&mut self, listener: impl ProcessListener + 'static) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }

    fn notify_failed(&self, reason: &RollbackReason) {
        for listener in &self.listeners {
            listener.on_failed(reason);
        }
    }

    fn notify_succeeded(&self) {
        for listener in &self.listeners {
            listener.on_succeeded();
        }
    }

    fn notify_finished(&self) {
        for listener in &self.listeners {
            listener.on_finished();
        }
    }

    /// Compensate children `0..=last` in reverse order.
    fn rollback_children(&mut self, last: usize, reason: &RollbackReason) {
        for child in self.children[..=last].iter_mut().rev() {
            if let Err(e) = child.rollback(reason) {
                warn!(process = %self.name, child = child.name(), error = %e, "rollback failed");
            }
        }
    }
}

impl ProcessComponent for SequentialProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn execute(&mut self, cancel: &CancelToken) -> Result<(), ProcessError> {
        if self.state != ProcessState::Ready {
            return Err(ProcessError::InvalidState(self.state));
        }
        self.state = ProcessState::Running;
        debug!(process = %self.name, children = self.children.len(), "sequential process started");

        for index in 0..self.children.len() {
            let result = if cancel.is_cancelled() {
                Err(ProcessError::Aborted)
            } else {
                self.children[index].execute(cancel)
            };

            if let Err(error) = result {
                let reason = RollbackReason::from(&error);
                self.state = ProcessState::Failed;
                self.notify_failed(&reason);

                self.state = ProcessState::Rollbacking;
                self.rollback_children(index, &reason);
                self.state = ProcessState::RolledBack;

                self.notify_finished();
                return Err(error);
            }
        }

        self.state = ProcessState::Succeeded;
        debug!(process = %self.name, "sequential process succeeded");
        self.notify_succeeded();
        self.notify_finished();
        Ok(())
    }

    fn rollback(&mut self, reason: &RollbackReason) -> Result<(), ProcessError> {
        match self.state {
            ProcessState::Ready => {
                self.state = ProcessState::RolledBack;
                Ok(())
            }
            ProcessState::Succeeded | ProcessState::Failed => {
                self.state = ProcessState::Rollbacking;
                if !self.children.is_empty() {
                    let last = self.children.len() - 1;
                    self.rollback_children(last, reason);
                }
                self.state = ProcessState::RolledBack;
                Ok(())
            }
            ProcessState::RolledBack => Ok(()),
            other => Err(ProcessError::InvalidState(other)),
        }
    }
}

/// Runs children concurrently; on any failure the remaining children are
/// cancelled and those that succeeded are compensated.
pub struct ParallelProcess {
    name: String,
    children: Vec<Box<dyn ProcessComponent>>,
    listeners: Vec<Box<dyn ProcessListener>>,
    state: ProcessState,
}

impl ParallelProcess {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            listeners: Vec::new(),
            state: ProcessState::Ready,
        }
    }

    pub fn add_step(&mut self, step: impl crate::step::ProcessStep + 'static) -> &mut Self {
        self.children.push(Box::new(crate::step::StepUnit::new(step)));
        self
    }

    pub fn add_component(&mut self, component: impl ProcessComponent + 'static) -> &mut Self {
        self.children.push(Box::new(component));
        self
    }

    pub fn add_listener(&mut self, listener: impl ProcessListener + 'static) -> &mut Self {
        self.listeners.push(Box::new(listener));
        self
    }
}

impl ProcessComponent for ParallelProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn execute(&mut self, cancel: &CancelToken) -> Result<(), ProcessError> {
        if self.state != ProcessState::Ready {
            return Err(ProcessError::InvalidState(self.state));
        }
        self.state = ProcessState::Running;
        debug!(process = %self.name, children = self.children.len(), "parallel process started");

        // Linked token: a failing child cancels its siblings without marking
        // the whole process as user-aborted.
        let inner = cancel.child();
        let (tx, rx) = mpsc::channel();

        let mut first_error: Option<ProcessError> = None;
        std::thread::scope(|scope| {
            for child in self.children.iter_mut() {
                let tx = tx.clone();
                let token = inner.clone();
                scope.spawn(move || {
                    let result = child.execute(&token);
                    let _ = tx.send(result.err());
                });
            }
            drop(tx);

            while let Ok(error) = rx.recv() {
                if let Some(error) = error {
                    if first_error.is_none() {
                        inner.cancel();
                        first_error = Some(error);
                    } else {
                        warn!(process = %self.name, error = %error, "additional parallel child failed");
                    }
                }
            }
        });

        if let Some(error) = first_error {
            let reason = RollbackReason::from(&error);
            self.state = ProcessState::Failed;
            for listener in &self.listeners {
                listener.on_failed(&reason);
            }

            self.state = ProcessState::Rollbacking;
            for child in self.children.iter_mut().rev() {
                if let Err(e) = child.rollback(&reason) {
                    warn!(process = %self.name, child = child.name(), error = %e, "rollback failed");
                }
            }
            self.state = ProcessState::RolledBack;

            for listener in &self.listeners {
                listener.on_finished();
            }
            return Err(error);
        }

        self.state = ProcessState::Succeeded;
        for listener in &self.listeners {
            listener.on_succeeded();
            listener.on_finished();
        }
        Ok(())
    }

    fn rollback(&mut self, reason: &RollbackReason) -> Result<(), ProcessError> {
        match self.state {
            ProcessState::Ready => {
                self.state = ProcessState::RolledBack;
                Ok(())
            }
            ProcessState::Succeeded | ProcessState::Failed => {
                self.state = ProcessState::Rollbacking;
                for child in self.children.iter_mut().rev() {
                    if let Err(e) = child.rollback(reason) {
                        warn!(process = %self.name, child = child.name(), error = %e, "rollback failed");
                    }
                }
                self.state = ProcessState::RolledBack;
                Ok(())
            }
            ProcessState::RolledBack => Ok(()),
            other => Err(ProcessError::InvalidState(other)),
        }
    }
}

/// A component that additionally exposes a typed result, extracted from the
/// operation's shared context once the inner component succeeds.
pub struct WithResult<T> {
    inner: Box<dyn ProcessComponent>,
    extract: Option<Box<dyn FnOnce() -> Option<T> + Send>>,
    result: Option<T>,
}

impl<T: Send + 'static> WithResult<T> {
    pub fn new(
        inner: impl ProcessComponent + 'static,
        extract: impl FnOnce() -> Option<T> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::new(inner),
            extract: Some(Box::new(extract)),
            result: None,
        }
    }

    /// The result, present only after a successful execution.
    pub fn take_result(&mut self) -> Option<T> {
        self.result.take()
    }
}

impl<T: Send + 'static> ProcessComponent for WithResult<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> ProcessState {
        self.inner.state()
    }

    fn execute(&mut self, cancel: &CancelToken) -> Result<(), ProcessError> {
        self.inner.execute(cancel)?;
        if let Some(extract) = self.extract.take() {
            self.result = extract();
        }
        Ok(())
    }

    fn rollback(&mut self, reason: &RollbackReason) -> Result<(), ProcessError> {
        self.result = None;
        self.inner.rollback(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::step::ProcessStep;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Records execution and rollback order into a shared journal.
    struct JournalStep {
        id: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl JournalStep {
        fn new(id: &'static str, journal: &Arc<Mutex<Vec<String>>>, fail: bool) -> Self {
            Self {
                id,
                journal: journal.clone(),
                fail,
                delay: None,
            }
        }
    }

    impl ProcessStep for JournalStep {
        fn name(&self) -> &str {
            self.id
        }

        fn run(&mut self, cancel: &CancelToken) -> Result<(), StepError> {
            if let Some(delay) = self.delay {
                let deadline = std::time::Instant::now() + delay;
                while std::time::Instant::now() < deadline {
                    if cancel.is_cancelled() {
                        return Err(StepError::new("cancelled"));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            self.journal.lock().push(format!("run:{}", self.id));
            if self.fail {
                Err(StepError::new(format!("{} failed", self.id)))
            } else {
                Ok(())
            }
        }

        fn undo(&mut self, _reason: &RollbackReason) {
            self.journal.lock().push(format!("undo:{}", self.id));
        }
    }

    #[test]
    fn test_sequential_success_runs_in_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut process = SequentialProcess::new("test");
        process
            .add_step(JournalStep::new("a", &journal, false))
            .add_step(JournalStep::new("b", &journal, false));

        process.execute(&CancelToken::new()).unwrap();

        assert_eq!(process.state(), ProcessState::Succeeded);
        assert_eq!(*journal.lock(), vec!["run:a", "run:b"]);
    }

    #[test]
    fn test_sequential_failure_rolls_back_in_reverse() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut process = SequentialProcess::new("test");
        process
            .add_step(JournalStep::new("a", &journal, false))
            .add_step(JournalStep::new("b", &journal, false))
            .add_step(JournalStep::new("c", &journal, true))
            .add_step(JournalStep::new("d", &journal, false));

        let error = process.execute(&CancelToken::new()).unwrap_err();

        assert!(matches!(error, ProcessError::StepFailed { .. }));
        assert_eq!(process.state(), ProcessState::RolledBack);
        assert_eq!(
            *journal.lock(),
            vec!["run:a", "run:b", "run:c", "undo:c", "undo:b", "undo:a"]
        );
    }

    #[test]
    fn test_failure_reason_names_failing_step() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut process = SequentialProcess::new("test");
        process.add_step(JournalStep::new("broken", &journal, true));

        let error = process.execute(&CancelToken::new()).unwrap_err();
        match error {
            ProcessError::StepFailed { step, source } => {
                assert_eq!(step, "broken");
                assert_eq!(source.message, "broken failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parallel_failure_cancels_siblings() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut process = ParallelProcess::new("test");

        let mut slow = JournalStep::new("slow", &journal, false);
        slow.delay = Some(Duration::from_secs(5));
        process.add_step(JournalStep::new("fast-fail", &journal, true));
        process.add_step(slow);

        let started = std::time::Instant::now();
        let error = process.execute(&CancelToken::new()).unwrap_err();

        assert!(matches!(error, ProcessError::StepFailed { .. }));
        // The slow sibling observed the cancellation instead of sleeping out.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(process.state(), ProcessState::RolledBack);
    }

    #[test]
    fn test_listener_receives_terminal_events() {
        struct Recorder {
            events: Arc<Mutex<Vec<String>>>,
        }
        impl ProcessListener for Recorder {
            fn on_succeeded(&self) {
                self.events.lock().push("succeeded".into());
            }
            fn on_failed(&self, reason: &RollbackReason) {
                self.events.lock().push(format!("failed:{}", reason.failed_step));
            }
            fn on_finished(&self) {
                self.events.lock().push("finished".into());
            }
        }

        let journal = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut ok = SequentialProcess::new("ok");
        ok.add_step(JournalStep::new("a", &journal, false))
            .add_listener(Recorder {
                events: events.clone(),
            });
        ok.execute(&CancelToken::new()).unwrap();

        let mut bad = SequentialProcess::new("bad");
        bad.add_step(JournalStep::new("b", &journal, true))
            .add_listener(Recorder {
                events: events.clone(),
            });
        let _ = bad.execute(&CancelToken::new());

        assert_eq!(
            *events.lock(),
            vec!["succeeded", "finished", "failed:b", "finished"]
        );
    }

    #[test]
    fn test_with_result_exposes_value_after_success() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::new(Mutex::new(Some(42u32)));

        let mut inner = SequentialProcess::new("inner");
        inner.add_step(JournalStep::new("a", &journal, false));

        let extract_slot = slot.clone();
        let mut process = WithResult::new(inner, move || extract_slot.lock().take());

        process.execute(&CancelToken::new()).unwrap();
        assert_eq!(process.take_result(), Some(42));
    }
}
