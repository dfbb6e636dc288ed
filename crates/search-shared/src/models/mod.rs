pub mod access;
pub mod chunks;
pub mod documents;
pub mod settings;

pub use access::{DocExternalAccess, DocumentAccess, ExternalAccess};
pub use chunks::{
    DocAwareChunk, DocMetadataAwareIndexChunk, IndexChunk, InferenceChunk, DEFAULT_BOOST,
};
pub use documents::{
    BasicExpertInfo, Document, DocumentSource, MetadataValue, Section, SlimDocument,
};
pub use settings::{SearchSettings, SearchSettingsStatus};
