use crate::internal::attrs::AttrRecord;
use crate::internal::common::ids::ExecutorHandle;

/// Advertisement transport. Publish errors are logged by the caller and
/// retried on the next advertise cycle; they never block the reactor.
pub trait AdvertSink {
    fn publish(&mut self, record: &AttrRecord) -> crate::Result<()>;

    /// Withdraws the advertisement matching the slot name.
    fn invalidate(&mut self, name: &str) -> crate::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Killed,
}

/// Job executor collaborator. Spawning is fire-and-forget from the
/// core's point of view; completion is delivered back asynchronously as
/// `SlotManager::executor_exited(handle, status)`.
pub trait JobExecutor {
    fn spawn(
        &mut self,
        job: &AttrRecord,
        slot_record: &AttrRecord,
    ) -> crate::Result<ExecutorHandle>;

    /// Asks the job to exit; `graceful` means signal-then-wait, otherwise
    /// immediate termination.
    fn stop(&mut self, handle: ExecutorHandle, graceful: bool);

    fn suspend(&mut self, handle: ExecutorHandle);

    fn resume(&mut self, handle: ExecutorHandle);

    /// Best-effort cleanup before the process terminates.
    fn kill_all(&mut self);
}
