pub mod http;
pub mod index;
pub mod kv;
pub mod llm;
pub mod models;
pub mod text;
