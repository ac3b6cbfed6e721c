pub mod cache;
pub mod graph;
pub mod handle;
pub mod scheduler;
pub mod types;


pub use cache::*;
pub use graph::*;
pub use handle::*;
pub use scheduler::*;
pub use types::*;
