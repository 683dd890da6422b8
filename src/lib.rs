mod catalog;
mod checkpoint;
mod config;
mod driver;
mod error;
mod handlers;
mod machine;
mod simpoint;
mod state;
mod stats;
mod target;
mod trace;
mod tracker;
mod utils;

pub use catalog::*;
pub use checkpoint::*;
pub use config::*;
pub use driver::*;
pub use error::*;
pub use handlers::*;
pub use machine::*;
pub use simpoint::*;
pub use state::*;
pub use stats::*;
pub use target::*;
pub use trace::*;
pub use tracker::*;
pub use utils::*;
