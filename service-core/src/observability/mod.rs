pub mod logging;

pub use logging::{init_fmt_tracing, init_tracing};
