pub mod chat;
pub mod client;
pub mod instruction;

pub use chat::ChatCompletionsClient;
pub use client::CodeGenerator;
pub use instruction::{ExecutionKind, GeneratedInstruction};
