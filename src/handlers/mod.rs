pub mod interviews;
pub mod models;
pub mod transcriptions;

pub use interviews::*;
pub use models::*;
pub use transcriptions::*;
