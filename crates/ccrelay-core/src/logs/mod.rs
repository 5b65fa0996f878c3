pub mod logger;
pub mod sink;

pub use sink::{ConsoleLogSink, LogRow, LogSink};
