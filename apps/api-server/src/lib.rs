mod ctx;
mod error;

pub mod config;
pub mod routes;
pub mod standalone;

pub use ctx::Ctx;
pub use error::ApiError;
