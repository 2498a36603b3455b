pub mod config;
pub mod error;
pub mod gallery;
pub mod messages;
pub mod upstream;

pub use config::*;
pub use error::*;
pub use gallery::*;
pub use messages::*;
pub use upstream::*;
