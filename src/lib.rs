pub mod cleaning;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod guests;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod time;
pub mod wal;
