//! HTTP Middleware

pub mod logging;
