pub mod files;
pub mod pipeline;

pub use files::FileReader;
pub use pipeline::{Pipeline, TaskResponse};
