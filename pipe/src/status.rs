use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created, thread not yet running
    NotStarted,

    /// Inside the processing loop
    Running,

    /// Asked to stop, finishing the current unit of work
    Stopping,

    /// Terminated; neighbours abort their I/O once they observe this
    Stopped,
}

impl Status {
    fn as_u8(self) -> u8 {
        match self {
            Status::NotStarted => 0,
            Status::Running => 1,
            Status::Stopping => 2,
            Status::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::NotStarted,
            1 => Status::Running,
            2 => Status::Stopping,
            _ => Status::Stopped,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NotStarted => write!(f, "Not Started"),
            Status::Running => write!(f, "Running"),
            Status::Stopping => write!(f, "Stopping"),
            Status::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Shared, lock-free status of one stage.
///
/// The owning stage writes it; neighbours and the pipe only read it (the pipe
/// additionally issues stop requests).
#[derive(Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Status::NotStarted.as_u8())))
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves the stage to `Running`, unless it was already asked to stop
    pub fn mark_running(&self) -> bool {
        self.0
            .compare_exchange(
                Status::NotStarted.as_u8(),
                Status::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// `Running -> Stopping`; every other state is left untouched
    pub fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(
                Status::Running.as_u8(),
                Status::Stopping.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Terminal transition, performed by the stage itself
    pub(crate) fn mark_stopped(&self) {
        self.0.store(Status::Stopped.as_u8(), Ordering::SeqCst);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusCell").field(&self.get()).finish()
    }
}

/// Marks the stage `Stopped` when dropped, including during a panic unwind,
/// so neighbours never wait on a dead thread
pub(crate) struct StopOnDrop(pub(crate) StatusCell);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}
