use crate::context::ProcessingContext;
use crate::error::{AnyItem, Interrupt};
use crate::status::{Status, StatusCell};
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::warn;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::time::Duration;

/// Bounded wait used by blocking reads and writes before re-checking the
/// neighbour's status
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Buffer capacity a source gets unless it asks for another one
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Type of the items a stage consumes or produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// No item flow on this side (a source's input, a sink's output)
    None,

    /// Wildcard, matches any type
    Any,

    /// A concrete item type
    Of { id: TypeId, name: &'static str },
}

impl ItemType {
    pub fn of<T: Any + Send>() -> Self {
        ItemType::Of {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ItemType::None)
    }

    /// Whether an upstream emitting `output` can feed a downstream accepting
    /// `input`
    pub fn connects(output: ItemType, input: ItemType) -> bool {
        match (output, input) {
            (ItemType::None, _) | (_, ItemType::None) => false,
            (ItemType::Any, _) | (_, ItemType::Any) => true,
            (ItemType::Of { id: out, .. }, ItemType::Of { id: inp, .. }) => out == inp,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::None => write!(f, "nothing"),
            ItemType::Any => write!(f, "anything"),
            ItemType::Of { name, .. } => write!(f, "{}", name),
        }
    }
}

/// Sending half of a link, together with the status of the stage it feeds.
///
/// Clones may be handed to worker threads owned by the stage.
#[derive(Clone)]
pub struct Outlet {
    tx: Sender<AnyItem>,
    downstream: StatusCell,
}

impl Outlet {
    pub(crate) fn new(tx: Sender<AnyItem>, downstream: StatusCell) -> Self {
        Self { tx, downstream }
    }

    /// Blocks until the buffer accepts the item. Gives the item back as
    /// `DownstreamGone` once the downstream stage is observed `Stopped`.
    pub fn write(&self, item: AnyItem) -> Result<(), Interrupt> {
        let mut item = item;
        loop {
            if self.downstream.get() == Status::Stopped {
                return Err(Interrupt::DownstreamGone(item));
            }
            match self.tx.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(back)) => {
                    return Err(Interrupt::DownstreamGone(back))
                }
            }
        }
    }

    pub fn send<T: Any + Send>(&self, item: T) -> Result<(), Interrupt> {
        self.write(Box::new(item))
    }

    /// Items currently buffered
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    pub fn downstream_status(&self) -> Status {
        self.downstream.get()
    }
}

/// Receiving half of a link, together with the status of the stage feeding it
pub struct Inlet {
    rx: Receiver<AnyItem>,
    upstream: StatusCell,
}

impl Inlet {
    pub(crate) fn new(rx: Receiver<AnyItem>, upstream: StatusCell) -> Self {
        Self { rx, upstream }
    }

    /// Blocks until an item arrives. Returns `UpstreamGone` once the upstream
    /// stage is `Stopped` and the buffer is drained.
    pub fn read(&self) -> Result<AnyItem, Interrupt> {
        loop {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(item) => return Ok(item),
                Err(RecvTimeoutError::Timeout) => {
                    if self.upstream.get() == Status::Stopped && self.rx.is_empty() {
                        return Err(Interrupt::UpstreamGone);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Interrupt::UpstreamGone),
            }
        }
    }
}

/// Everything a processor sees of its position in the chain while running
pub struct Stage {
    name: String,
    index: usize,
    status: StatusCell,
    inlet: Option<Inlet>,
    outlet: Option<Outlet>,
    context: ProcessingContext,
}

impl Stage {
    pub(crate) fn new(
        name: String,
        index: usize,
        status: StatusCell,
        inlet: Option<Inlet>,
        outlet: Option<Outlet>,
        context: ProcessingContext,
    ) -> Self {
        Self {
            name,
            index,
            status,
            inlet,
            outlet,
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the chain, 0 for the first stage
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.status.get() == Status::Running
    }

    /// Handle to this stage's status, for threads the stage spawns
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// Enters `Running`. Called by a processor's run loop after `pre_run`.
    pub fn enter_running(&self) -> bool {
        self.status.mark_running()
    }

    /// Self-initiated stop, `Running -> Stopping`
    pub fn request_stop(&self) -> bool {
        self.status.request_stop()
    }

    pub fn context(&self) -> &ProcessingContext {
        &self.context
    }

    /// Reads the next item. A stage without an upstream has nothing to read
    /// and gets `UpstreamGone`.
    pub fn read(&self) -> Result<AnyItem, Interrupt> {
        match &self.inlet {
            Some(inlet) => inlet.read(),
            None => Err(Interrupt::UpstreamGone),
        }
    }

    /// Reads the next item of type `T`, skipping anything else
    pub fn read_as<T: Any + Send>(&self) -> Result<T, Interrupt> {
        loop {
            match self.read()?.downcast::<T>() {
                Ok(item) => return Ok(*item),
                Err(_) => warn!(
                    "{}: skipping item that is not a {}",
                    self.name,
                    type_name::<T>()
                ),
            }
        }
    }

    /// Writes an item downstream. A stage without a downstream neighbour
    /// gets the item back as `DownstreamGone`.
    pub fn write(&self, item: AnyItem) -> Result<(), Interrupt> {
        match &self.outlet {
            Some(outlet) => outlet.write(item),
            None => Err(Interrupt::DownstreamGone(item)),
        }
    }

    pub fn send<T: Any + Send>(&self, item: T) -> Result<(), Interrupt> {
        self.write(Box::new(item))
    }

    /// A clone of the outgoing link, for worker threads that emit items
    pub fn outlet(&self) -> Option<Outlet> {
        self.outlet.clone()
    }
}
