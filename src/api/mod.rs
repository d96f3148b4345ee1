//! Operator control API.

pub mod routes;

pub use routes::create_router;
