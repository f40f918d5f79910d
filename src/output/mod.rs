//! Where telemetry ends up besides the log.

mod csv;
mod file;
mod osc;

pub use self::csv::CsvSink;
pub use self::file::FileSink;
pub use self::osc::{forward_pulses, heartrate_messages, pulse_messages, OscEmitter, OscSink};

pub const DEFAULT_FILE_OUTPUT: &str = "heartrate.txt";
pub const DEFAULT_CSV_OUTPUT: &str = "heartrate.csv";
pub const DEFAULT_OSC_TARGET: &str = "127.0.0.1:9000";
