pub mod custom_tool;
pub mod freshdesk;
pub mod openapi;

pub use custom_tool::{CustomTool, FileStore, LocalFileStore};
pub use openapi::{openapi_to_method_specs, openapi_to_url, MethodSpec};
