pub mod fence;
pub mod models;
pub mod repository;

pub use fence::{FenceManager, FencePayload, FenceValidator, StaleAttemptSink};
pub use models::{
    ConnectorCredentialPair, IndexAttempt, IndexingStatus, IndexingTrigger, PairStatus,
};
pub use repository::CoordinationRepository;
