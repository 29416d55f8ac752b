// Domain layer: request-scoped value types and the outbound inference port.

pub mod model;
pub mod ports;
