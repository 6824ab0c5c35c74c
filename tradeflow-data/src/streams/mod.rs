/// Read timeout wrapper that ends a silent socket stream.
pub mod timeout;
