use std::io::Write;

use env_logger::fmt::Formatter;
use env_logger::fmt::style::Style;
use log::{LevelFilter, Record};

fn default_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// `<time> <level> <message>`
fn format_short(buf: &mut Formatter, record: &Record) -> std::io::Result<()> {
    let level = buf.default_level_style(record.level()).bold();
    let dim = Style::new().dimmed();
    writeln!(
        buf,
        "{dim}{}{dim:#} {level}{:<5}{level:#} {}",
        buf.timestamp_seconds(),
        record.level(),
        record.args()
    )
}

/// Initializes the global logger.
///
/// Verbose output includes millisecond timestamps and the module that emitted the record.
/// `RUST_LOG` takes precedence over the default level.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level(verbose));
    if verbose {
        builder.format_timestamp_millis().format_target(true);
    } else {
        builder.format(format_short);
    }
    builder.parse_default_env();
    builder.init();
}
