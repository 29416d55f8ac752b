// Adapters layer: concrete implementations of the outbound vision-inference port.

pub mod fallback;
pub mod http;
