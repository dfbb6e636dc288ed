pub mod chunker;
pub mod embedder;
pub mod pipeline;

pub use chunker::Chunker;
pub use embedder::{EmbeddingProvider, HttpEmbedder};
pub use pipeline::IndexingPipeline;
