//! Cross-module integration tests: the behaviors in spec for end-to-end
//! task delivery and the HTTP binding wired together, beyond what each
//! module's own unit tests already cover in isolation.


#[cfg(test)]
mod http_api;
