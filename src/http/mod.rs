//! HTTP surface: the gate middleware and the server that hosts it.

mod gate;
mod server;

pub use gate::{
    plain_error, rate_limit, Gate, GateError, INTERNAL_ERROR_BODY, RATE_LIMITED_BODY,
    REQUEST_ID_HEADER,
};
pub use server::{build_router, gate_routes, HttpServer};
