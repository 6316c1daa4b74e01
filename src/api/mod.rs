//! HTTP surface: routes, handlers, middleware, response mapping.
//!
//! Everything here is a thin shell over the core subsystems; business rules
//! live in `cache`, `profile`, `verify`, and `queue`.

pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;

pub use responses::ApiError;
pub use routes::router;
