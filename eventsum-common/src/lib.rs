pub mod bucket;
pub mod failures;
pub mod fingerprint;
pub mod health;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod rules;
pub mod store;
