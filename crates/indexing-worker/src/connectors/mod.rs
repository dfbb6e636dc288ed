pub mod confluence;
pub mod file;
pub mod freshdesk;
pub mod freshdesk_solutions;
pub mod google_drive;
pub mod interfaces;
pub mod registry;
pub mod salesforce;
pub mod web;

pub use interfaces::{
    BatchStream, CheckpointBatch, Checkpoint, ConnectorError, ConnectorFailure, ConnectorResult,
    IndexingHeartbeat, NoopHeartbeat, SlimBatchStream,
};
pub use registry::{ConnectorDeps, ConnectorRunner, SourceConnector};
