#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod caption;
mod device;
mod error;
mod generation;
mod loader;
mod provider;
mod traits;
mod upload;

pub mod git;

pub use caption::*;
pub use device::*;
pub use error::*;
pub use generation::*;
pub use provider::*;
pub use traits::*;
pub use upload::*;
