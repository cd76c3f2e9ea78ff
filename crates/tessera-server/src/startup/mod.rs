pub mod logging;
pub mod shutdown;

pub use logging::{LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownReport, ShutdownSequence, StepOutcome, spawn_signal_listener};
