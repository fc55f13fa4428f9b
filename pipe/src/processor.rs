use crate::context::{ContextDep, ProcessingContext};
use crate::error::{AnyItem, Interrupt, Result};
use crate::link::{ItemType, Stage, DEFAULT_BUFFER_CAPACITY};
use crate::status::Status;
use log::debug;

/// What the run loop does after one `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The stage has no more work and terminates on its own
    Finished,
}

/// A stage of a chain.
///
/// Sources declare `input() == ItemType::None`, sinks declare
/// `output() == ItemType::None`, filters declare both sides. Hooks are
/// called by the [`Pipe`](crate::Pipe) in this order: `set_context`,
/// dependency check, `init_context`, `can_start`, then `run` on the stage's
/// own thread.
pub trait Processor: Send + 'static {
    fn name(&self) -> &str;

    fn input(&self) -> ItemType {
        ItemType::None
    }

    fn output(&self) -> ItemType {
        ItemType::None
    }

    /// Capacity of the buffer between this stage and the next one
    fn buffer_capacity(&self) -> usize {
        DEFAULT_BUFFER_CAPACITY
    }

    /// First look at the shared context. Values already present may be read,
    /// own values may be published.
    fn set_context(&mut self, _ctx: &ProcessingContext) -> Result<()> {
        Ok(())
    }

    /// Context values that must exist before `init_context`
    fn context_deps(&self) -> Vec<ContextDep> {
        Vec::new()
    }

    /// Called once every declared dependency is present with its type
    fn init_context(&mut self, _ctx: &ProcessingContext) -> Result<()> {
        Ok(())
    }

    /// Start precondition; the error is the reason reported by the pipe
    fn can_start(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn pre_run(&mut self, _stage: &Stage) {}

    /// One unit of work
    fn process(&mut self, stage: &Stage) -> std::result::Result<Flow, Interrupt>;

    fn post_run(&mut self, _stage: &Stage) {}

    /// The downstream stage stopped; `item` could not be delivered
    fn handle_stopped_sink(&mut self, stage: &Stage, _item: AnyItem) {
        debug!("{}: downstream stopped, dropping undelivered item", stage.name());
    }

    /// The upstream stage stopped and its buffer is drained
    fn handle_stopped_source(&mut self, stage: &Stage) {
        debug!("{}: upstream stopped", stage.name());
    }

    /// Default loop: `pre_run`, enter `Running`, call `process` while
    /// running, `post_run`. The pipe marks the stage `Stopped` afterwards.
    fn run(&mut self, stage: &Stage) {
        self.pre_run(stage);
        stage.enter_running();
        while stage.status() == Status::Running {
            match self.process(stage) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => break,
                Err(Interrupt::UpstreamGone) => {
                    self.handle_stopped_source(stage);
                    break;
                }
                Err(Interrupt::DownstreamGone(item)) => {
                    self.handle_stopped_sink(stage, item);
                    break;
                }
            }
        }
        self.post_run(stage);
    }
}

/// A helper running next to the chain on its own thread, with access to the
/// shared context but no part in the item flow.
///
/// Implementors are shared between the pipe and their thread, so hooks take
/// `&self`.
pub trait AttachedProcess: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Before any stage sees the context
    fn pre_context(&self, _ctx: &ProcessingContext) {}

    /// After every stage initialized its context, right before threads start
    fn post_context(&self, _ctx: &ProcessingContext) {}

    /// Processes failing this are skipped, not attached
    fn can_start(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn run(&self, ctx: &ProcessingContext);

    /// All stages reached `Stopped`
    fn chain_stopped(&self, _ctx: &ProcessingContext) {}

    /// Asks `run` to return
    fn stop(&self) {}
}
