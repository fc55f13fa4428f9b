use crate::context::ProcessingContext;
use crate::error::{PipeError, Result};
use crate::link::{Inlet, ItemType, Outlet, Stage, POLL_INTERVAL};
use crate::processor::{AttachedProcess, Processor};
use crate::status::{Status, StatusCell, StopOnDrop};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Stops a pipe from another thread, such as a signal handler
#[derive(Debug, Clone)]
pub struct StopHandle(Option<StatusCell>);

impl StopHandle {
    /// Requests an orderly stop, as [`Pipe::stop`] does. False when the
    /// chain is not running.
    pub fn stop(&self) -> bool {
        self.0.as_ref().map_or(false, StatusCell::request_stop)
    }
}

/// A chain of processors connected by bounded buffers, each running on its
/// own thread, plus attached helper processes.
pub struct Pipe {
    processors: Vec<Box<dyn Processor>>,
    attached: Vec<Arc<dyn AttachedProcess>>,
    running_attached: Vec<Arc<dyn AttachedProcess>>,
    context: ProcessingContext,
    statuses: Vec<StatusCell>,
    handles: Vec<JoinHandle<()>>,
    started: bool,
    chain_stopped: bool,
}

impl Pipe {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self::with_context(processors, ProcessingContext::new())
    }

    /// Uses an externally seeded context
    pub fn with_context(processors: Vec<Box<dyn Processor>>, context: ProcessingContext) -> Self {
        let statuses = processors.iter().map(|_| StatusCell::new()).collect();
        Self {
            processors,
            attached: Vec::new(),
            running_attached: Vec::new(),
            context,
            statuses,
            handles: Vec::new(),
            started: false,
            chain_stopped: false,
        }
    }

    pub fn attach(&mut self, process: Arc<dyn AttachedProcess>) {
        self.attached.push(process);
    }

    pub fn context(&self) -> &ProcessingContext {
        &self.context
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.statuses.first().cloned())
    }

    /// Status of each stage, first to last
    pub fn stage_statuses(&self) -> Vec<Status> {
        self.statuses.iter().map(StatusCell::get).collect()
    }

    /// Derived from the stage statuses: `NotStarted` until the first stage
    /// starts, `Running`/`Stopped` only when all stages agree, `Stopping`
    /// for any mix
    pub fn status(&self) -> Status {
        let statuses = self.stage_statuses();
        match statuses.first() {
            None | Some(Status::NotStarted) => Status::NotStarted,
            Some(_) if statuses.iter().all(|s| *s == Status::Running) => Status::Running,
            Some(_) if statuses.iter().all(|s| *s == Status::Stopped) => Status::Stopped,
            Some(_) => Status::Stopping,
        }
    }

    fn validate(&self) -> Result<()> {
        let first = self.processors.first().ok_or(PipeError::Empty)?;
        if !first.input().is_none() {
            return Err(PipeError::Mismatch {
                upstream: "(chain start)".to_string(),
                output: ItemType::None.to_string(),
                downstream: first.name().to_string(),
                input: first.input().to_string(),
            });
        }
        for pair in self.processors.windows(2) {
            let (up, down) = (&pair[0], &pair[1]);
            if !ItemType::connects(up.output(), down.input()) {
                return Err(PipeError::Mismatch {
                    upstream: up.name().to_string(),
                    output: up.output().to_string(),
                    downstream: down.name().to_string(),
                    input: down.input().to_string(),
                });
            }
        }
        if let Some(last) = self.processors.last() {
            if !last.output().is_none() {
                return Err(PipeError::Mismatch {
                    upstream: last.name().to_string(),
                    output: last.output().to_string(),
                    downstream: "(chain end)".to_string(),
                    input: ItemType::None.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Hands the context to every stage and resolves their dependencies.
    /// Returns the failure of each stage, if any.
    fn bind_context(&mut self) -> Vec<Option<String>> {
        let ctx = self.context.clone();
        let mut failures: Vec<Option<String>> = vec![None; self.processors.len()];

        for (i, processor) in self.processors.iter_mut().enumerate() {
            if let Err(e) = processor.set_context(&ctx) {
                error!("{}: {}", processor.name(), e);
                failures[i] = Some(e.to_string());
            }
        }

        for (i, processor) in self.processors.iter_mut().enumerate() {
            if failures[i].is_some() {
                continue;
            }
            let unresolved = processor
                .context_deps()
                .iter()
                .find_map(|dep| ctx.check(processor.name(), dep).err());
            let outcome = match unresolved {
                Some(e) => Err(e),
                None => processor.init_context(&ctx),
            };
            if let Err(e) = outcome {
                error!("{}: {}", processor.name(), e);
                failures[i] = Some(e.to_string());
            }
        }
        failures
    }

    /// Starts the chain. With `blocking` the call returns once every stage
    /// stopped and the attached processes were told so.
    pub fn start(&mut self, blocking: bool) -> Result<()> {
        if self.started {
            return Err(PipeError::AlreadyStarted);
        }
        self.validate()?;

        // links, capacity chosen by the upstream side
        let count = self.processors.len();
        let mut inlets: Vec<Option<Inlet>> = (0..count).map(|_| None).collect();
        let mut outlets: Vec<Option<Outlet>> = (0..count).map(|_| None).collect();
        for i in 0..count.saturating_sub(1) {
            let (tx, rx) = flume::bounded(self.processors[i].buffer_capacity().max(1));
            outlets[i] = Some(Outlet::new(tx, self.statuses[i + 1].clone()));
            inlets[i + 1] = Some(Inlet::new(rx, self.statuses[i].clone()));
        }

        for process in &self.attached {
            process.pre_context(&self.context);
        }

        let mut failures = self.bind_context();

        for (i, processor) in self.processors.iter().enumerate() {
            let reason = failures[i].take().or_else(|| processor.can_start().err());
            if let Some(reason) = reason {
                error!(
                    "Pipe cannot start, processor {} is not ready: {}",
                    processor.name(),
                    reason
                );
                return Err(PipeError::CannotStart {
                    stage: processor.name().to_string(),
                    reason,
                });
            }
        }
        self.started = true;

        for process in &self.attached {
            match process.can_start() {
                Ok(()) => self.running_attached.push(process.clone()),
                Err(reason) => warn!(
                    "Attached process {} cannot start and will be skipped: {}",
                    process.name(),
                    reason
                ),
            }
        }
        for process in &self.running_attached {
            process.post_context(&self.context);
        }
        for process in &self.running_attached {
            let process = process.clone();
            let ctx = self.context.clone();
            // detached, never joined
            thread::Builder::new()
                .name(format!("attached-{}", process.name()))
                .spawn(move || process.run(&ctx))?;
        }

        let processors = std::mem::take(&mut self.processors);
        for (i, ((mut processor, inlet), outlet)) in processors
            .into_iter()
            .zip(inlets)
            .zip(outlets)
            .enumerate()
        {
            let name = processor.name().to_string();
            let status = self.statuses[i].clone();
            let stage = Stage::new(
                name.clone(),
                i,
                status.clone(),
                inlet,
                outlet,
                self.context.clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("{}-{}", i, name))
                .spawn(move || {
                    let _stopped = StopOnDrop(status);
                    debug!("{} started", stage.name());
                    processor.run(&stage);
                    debug!("{} finished", stage.name());
                })?;
            self.handles.push(handle);
        }
        info!("Pipe started with {} processors", count);

        if blocking {
            self.wait();
        }
        Ok(())
    }

    /// Waits for every stage thread, then notifies attached processes once
    pub fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("stage").to_string();
            if handle.join().is_err() {
                error!("Processor thread {} panicked", name);
            }
        }
        if self.started && !self.chain_stopped {
            self.chain_stopped = true;
            info!("Pipe stopped");
            for process in &self.running_attached {
                process.chain_stopped(&self.context);
                process.stop();
            }
        }
    }

    /// Requests the first stage to stop; later stages follow as their
    /// upstream terminates
    pub fn stop(&mut self, blocking: bool) {
        if !self.started {
            return;
        }
        if let Some(first) = self.statuses.first() {
            while first.get() == Status::NotStarted {
                thread::sleep(POLL_INTERVAL);
            }
            if first.request_stop() {
                info!("Stop requested");
            }
        }
        if blocking {
            self.wait();
        }
    }

    /// Marks every stage `Stopped` and abandons their threads.
    ///
    /// Items in flight are lost and processors may be left mid-operation.
    /// Use [`stop`](Self::stop) for an orderly shutdown.
    pub fn kill(&mut self) {
        warn!("Killing pipe, processor state may be inconsistent");
        for status in &self.statuses {
            status.mark_stopped();
        }
        self.handles.clear();
        for process in &self.running_attached {
            process.stop();
        }
    }
}
