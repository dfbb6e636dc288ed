pub mod models;
pub mod repository;

pub use models::{ChatMessage, ChatSession, MessageType};
pub use repository::ChatRepository;
