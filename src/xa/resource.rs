use crate::core::error::Result;
use crate::storage::metadata::MetadataRecord;
use crate::xa::xid::Xid;

/// Answer to a prepare request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Nothing was written; the branch is already finished.
    ReadOnly,
    /// Prepared and durable; waiting for the decision.
    Ok,
}

/// A branch participant in two-phase commit, as seen by a coordinator.
pub trait XaResource {
    fn start(&mut self, xid: &Xid) -> Result<()>;

    fn end(&mut self, xid: &Xid) -> Result<()>;

    fn prepare(&mut self, xid: &Xid) -> Result<Vote>;

    /// Commits `xid`. With `one_phase` the prepare step is skipped.
    fn commit(&mut self, xid: &Xid, one_phase: bool) -> Result<()>;

    fn rollback(&mut self, xid: &Xid) -> Result<()>;

    /// Prepared branches whose outcome was lost in a crash.
    fn recover(&self) -> Result<Vec<Xid>>;

    /// Identity of the resource manager behind this resource.
    fn identity(&self) -> MetadataRecord;

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.identity().same_identity(&other.identity())
    }
}

/// The durable side of a resource manager: versioning and recovery.
pub trait XaDataSource {
    fn current_version(&self) -> i64;

    /// Bumps the persisted version, returning the one it replaced.
    fn get_and_set_new_version(&self) -> Result<i64>;

    fn last_committed_tx(&self) -> i64;

    /// Ends recovery: replayed work becomes visible and the log may rotate.
    fn recovery_complete(&self) -> Result<()>;
}
