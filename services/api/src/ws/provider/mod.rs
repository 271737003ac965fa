//! Connectors to third-party realtime voice APIs.

pub mod openai;

pub use openai::OpenAiRealtime;
