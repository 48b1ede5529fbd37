use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::execution::{Executor, default_executor};
use crate::models::{CoreError, Failure, Outcome, RunnerSnapshot};
use crate::orchestration::{RunnerDelegate, TaskSource};
use crate::promise::{Cancelable, Promise, Resolver};
use crate::task_context::{self, TaskScope};

#[derive(Clone, Debug)]
enum StepResult {
    Completed,
    Rescued,
    Skipped(Failure),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Launch {
    Start,
    Resume,
    Run,
}

#[derive(Default)]
struct RunnerState {
    current_index: usize,
    is_running: bool,
    has_run: bool,
    generation: u64,
    in_flight: Option<Promise<()>>,
}

struct Shared {
    source: RwLock<Option<Weak<dyn TaskSource>>>,
    delegate: RwLock<Option<Weak<dyn RunnerDelegate>>>,
    executor: Arc<dyn Executor>,
    state: Mutex<RunnerState>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn source(&self) -> Option<Arc<dyn TaskSource>> {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn delegate(&self) -> Option<Arc<dyn RunnerDelegate>> {
        self.delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn notify(&self, event: impl FnOnce(&dyn RunnerDelegate)) {
        if let Some(delegate) = self.delegate() {
            event(delegate.as_ref());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_state().generation == generation
    }

    fn finish(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.is_running = false;
        }
    }
}

/// Runs the tasks of a [`TaskSource`] one after another.
///
/// The runner holds neither the source nor the delegate alive; both are
/// attached as weak references. Only one run is in flight at a time:
/// starting another one cancels the previous run, and a superseded run never
/// moves the cursor or notifies the delegate again.
#[derive(Clone)]
pub struct TaskRunner {
    shared: Arc<Shared>,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::with_executor(default_executor())
    }

    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                source: RwLock::new(None),
                delegate: RwLock::new(None),
                executor,
                state: Mutex::new(RunnerState::default()),
            }),
        }
    }

    pub fn set_task_source<S: TaskSource + 'static>(&self, source: &Arc<S>) {
        let source: Arc<dyn TaskSource> = source.clone();
        *self
            .shared
            .source
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&source));
    }

    pub fn clear_task_source(&self) {
        *self
            .shared
            .source
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_delegate<D: RunnerDelegate + 'static>(&self, delegate: &Arc<D>) {
        let delegate: Arc<dyn RunnerDelegate> = delegate.clone();
        *self
            .shared
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&delegate));
    }

    pub fn clear_delegate(&self) {
        *self
            .shared
            .delegate
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn task_count(&self) -> usize {
        self.shared
            .source()
            .map_or(0, |source| source.task_count())
    }

    pub fn current_task_index(&self) -> usize {
        self.shared.lock_state().current_index
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_state().is_running
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let task_count = self.task_count();
        let state = self.shared.lock_state();
        RunnerSnapshot {
            current_task_index: state.current_index,
            task_count,
            is_running: state.is_running,
            run_status: state.in_flight.as_ref().map(Promise::status),
        }
    }

    /// Runs every task from the first one.
    pub fn start(&self) -> Promise<()> {
        self.launch(true, Launch::Start)
    }

    /// Continues from the task where the last run stopped. Behaves like
    /// [`TaskRunner::start`] if the runner never ran.
    pub fn resume(&self) -> Promise<()> {
        if !self.shared.lock_state().has_run {
            return self.start();
        }
        self.launch(false, Launch::Resume)
    }

    /// Runs the remaining tasks, or all of them when `restart` is set.
    ///
    /// Fulfills once the cursor reaches the end of the task list and rejects
    /// with the error of the first required task that failed irrecoverably.
    pub fn run(&self, restart: bool) -> Promise<()> {
        self.launch(restart, Launch::Run)
    }

    /// Cancels the in-flight run. The task currently executing receives a
    /// cancel request and the cursor stays on it.
    ///
    /// A later [`TaskRunner::resume`] therefore runs the interrupted task
    /// again before moving on, rather than skipping past it; use
    /// [`TaskRunner::start`] to begin again from the first task.
    pub fn cancel(&self) {
        let in_flight = {
            let mut state = self.shared.lock_state();
            state.generation += 1;
            state.is_running = false;
            state.in_flight.take()
        };

        if let Some(run) = in_flight {
            tracing::debug!("cancelling in-flight task run");
            run.cancel();
        }
    }

    fn launch(&self, restart: bool, launch: Launch) -> Promise<()> {
        let shared = &self.shared;
        if shared.source().is_none() {
            tracing::warn!("task run requested without a task source");
            return Promise::rejected(CoreError::no_task_source()).on(shared.executor.clone());
        }

        let (generation, previous) = {
            let mut state = shared.lock_state();
            state.generation += 1;
            (state.generation, state.in_flight.take())
        };

        if let Some(previous) = previous {
            tracing::debug!(generation, "superseding previous task run");
            previous.cancel();
        }

        let start_index = {
            let mut state = shared.lock_state();
            if restart {
                state.current_index = 0;
            }
            state.is_running = true;
            state.has_run = true;
            state.current_index
        };

        match launch {
            Launch::Start => shared.notify(|delegate| delegate.will_start()),
            Launch::Resume => shared.notify(|delegate| delegate.will_resume()),
            Launch::Run => {}
        }
        tracing::info!(generation, start_index, restart, "task run started");

        let (steps, resolver) = Promise::pending_on(shared.executor.clone());
        let run_loop = Arc::new(RunLoop {
            shared: shared.clone(),
            generation,
            resolver,
            current: Mutex::new(None),
            pump: Mutex::new(PumpState::default()),
        });
        run_loop
            .resolver
            .bind_cancelable(Arc::new(CancelRun(Arc::downgrade(&run_loop))));

        let run = steps
            .then({
                let shared = shared.clone();
                move |()| {
                    if shared.is_current(generation) {
                        tracing::info!(generation, "task run finished");
                        shared.notify(|delegate| delegate.run_finished(None));
                    }
                    Ok(())
                }
            })
            .catch({
                let shared = shared.clone();
                move |failure| {
                    if shared.is_current(generation) {
                        shared.notify(|delegate| delegate.run_finished(Some(failure)));
                    }
                    Ok(())
                }
            })
            .always({
                let shared = shared.clone();
                move || shared.finish(generation)
            });

        {
            let mut state = shared.lock_state();
            if state.generation == generation {
                state.in_flight = Some(run.clone());
            }
        }
        run_loop.pump();
        run
    }
}

fn superseded() -> CoreError {
    CoreError::cancelled("task run was cancelled or superseded")
}

#[derive(Default)]
struct PumpState {
    active: bool,
    again: bool,
}

/// Drives one run: starts a task, waits for its step to settle, advances the
/// cursor and starts the next. Steps that settle while the loop is still on
/// the stack queue another turn instead of recursing, so the stack depth does
/// not grow with the number of tasks.
struct RunLoop {
    shared: Arc<Shared>,
    generation: u64,
    resolver: Resolver<()>,
    current: Mutex<Option<Promise<StepResult>>>,
    pump: Mutex<PumpState>,
}

impl RunLoop {
    fn lock_pump(&self) -> MutexGuard<'_, PumpState> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pump(self: &Arc<Self>) {
        {
            let mut pump = self.lock_pump();
            if pump.active {
                pump.again = true;
                return;
            }
            pump.active = true;
        }

        loop {
            self.execute_next();

            let mut pump = self.lock_pump();
            if !pump.again {
                pump.active = false;
                return;
            }
            pump.again = false;
        }
    }

    fn execute_next(self: &Arc<Self>) {
        let shared = &self.shared;
        let generation = self.generation;
        if !shared.is_current(generation) {
            self.resolver.reject(superseded());
            return;
        }

        let Some(source) = shared.source() else {
            self.resolver.reject(CoreError::no_task_source());
            return;
        };

        let index = shared.lock_state().current_index;
        if index >= source.task_count() {
            self.resolver.fulfill(());
            return;
        }

        let task = source.task_at(index);
        drop(source);
        let task_id = task.id().to_string();

        shared.notify(|delegate| delegate.will_run_task(index));
        tracing::info!(index, task = %task_id, "running task");

        let scope = TaskScope {
            index,
            id: task_id.clone(),
        };
        let work =
            task_context::with_task(scope, || catch_unwind(AssertUnwindSafe(|| task.run())))
                .unwrap_or_else(|payload| {
                    Promise::rejected(
                        CoreError::from_panic(payload.as_ref()).at_task(index, &task_id),
                    )
                });

        let step = work
            .on(shared.executor.clone())
            .then(|()| Ok(StepResult::Completed))
            .recover_with({
                let shared = shared.clone();
                move |failure| {
                    if !shared.is_current(generation) {
                        return Err(failure);
                    }
                    rescue(&shared, index, failure)
                }
            })
            .recover({
                let shared = shared.clone();
                move |failure| {
                    let required = shared
                        .source()
                        .is_none_or(|source| source.is_required(index));
                    if required {
                        Err(failure)
                    } else {
                        Ok(StepResult::Skipped(failure))
                    }
                }
            })
            .catch({
                let shared = shared.clone();
                let task_id = task_id.clone();
                move |failure| {
                    if shared.is_current(generation) {
                        tracing::error!(index, task = %task_id, error = %failure, "required task failed, stopping run");
                        shared.notify(|delegate| {
                            delegate.task_finished(index, Some(failure));
                            delegate.run_stopped(index, failure);
                        });
                    }
                    Ok(())
                }
            });

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(step.clone());
        let run_loop = self.clone();
        step.on_settle(move |outcome| run_loop.finish_step(index, &task_id, outcome));
    }

    fn finish_step(self: &Arc<Self>, index: usize, task_id: &str, outcome: Outcome<StepResult>) {
        let step = match outcome {
            Ok(step) => step,
            Err(failure) => {
                self.resolver.reject(failure);
                return;
            }
        };

        {
            let mut state = self.shared.lock_state();
            if state.generation != self.generation {
                tracing::debug!(index, task = %task_id, "dropping result of superseded run");
                drop(state);
                self.resolver.reject(superseded());
                return;
            }
            state.current_index = index + 1;
        }

        match &step {
            StepResult::Completed => {
                tracing::info!(index, task = %task_id, "task finished");
                self.shared.notify(|delegate| delegate.task_finished(index, None));
            }
            StepResult::Rescued => {
                tracing::info!(index, task = %task_id, "task finished after rescue");
                self.shared.notify(|delegate| delegate.task_finished(index, None));
            }
            StepResult::Skipped(failure) => {
                tracing::warn!(index, task = %task_id, error = %failure, "optional task failed, continuing");
                self.shared
                    .notify(|delegate| delegate.task_finished(index, Some(failure)));
            }
        }

        self.pump();
    }
}

/// Forwards a cancel request on a run to the step it is waiting on.
struct CancelRun(Weak<RunLoop>);

impl Cancelable for CancelRun {
    fn cancel(&self) {
        let Some(run_loop) = self.0.upgrade() else {
            return;
        };
        let current = run_loop
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(step) = current {
            step.cancel();
        }
    }
}

fn rescue(shared: &Shared, index: usize, failure: Failure) -> Outcome<Promise<StepResult>> {
    let Some(source) = shared.source() else {
        return Err(failure);
    };
    if !source.can_rescue(index, &failure) {
        return Err(failure);
    }

    tracing::info!(index, error = %failure, "attempting task rescue");
    let (rescued, resolver) = Promise::pending_on(shared.executor.clone());
    source.rescue(
        index,
        Box::new(move |error| match error {
            None => {
                resolver.fulfill(StepResult::Rescued);
            }
            Some(error) => {
                resolver.reject(error);
            }
        }),
    );
    Ok(rescued)
}
