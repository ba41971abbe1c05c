#[macro_use]
pub mod internal;

pub use crate::internal::common::ids::{ChildIndex, ExecutorHandle, SlotId, SlotTypeId};
pub use crate::internal::common::Map;

pub type Error = internal::common::error::SlotError;
pub type Result<T> = std::result::Result<T, Error>;

pub mod control {
    pub use crate::internal::manager::drain::{DrainBook, DrainEpoch};
    pub use crate::internal::manager::{PolicyConfig, SlotConfig, SlotManager};
}

pub mod slots {
    pub use crate::internal::slot::claim::{
        Claim, ClaimId, ClaimLadder, ClaimState, ClaimType, ClientIdentity, SuspendedBy,
    };
    pub use crate::internal::slot::state::{Activity, SlotState};
    pub use crate::internal::slot::{Slot, SlotFeature};
}

pub mod protocol {
    pub use crate::internal::messages::{
        ActivateRequest, ActivateResponse, ClaimRequest, ClaimResponse, DrainCommand,
        DrainCompletion, DrainError, DrainSpeed, OpResponse, RefusalReason,
    };
}

pub mod records {
    pub use crate::internal::attrs::{AttrRecord, AttrValue, names};
    pub use crate::internal::capacity::amount::ResourceAmount;
    pub use crate::internal::capacity::pool::AssetPool;
}

pub mod seams {
    pub use crate::internal::comm::{AdvertSink, ExitStatus, JobExecutor};
    pub use crate::internal::eval::{Evaluator, Value};
}
