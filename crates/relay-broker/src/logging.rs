use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;

/// Install the process-wide subscriber. `level` follows the CLI scale
/// (0 Trace, 1 Debug, 2 Info, 3 Warning, 4/5 Error); with `to_file` set,
/// output goes to a daily-rolling file under `./logs` instead of stderr.
///
/// Returns the guard keeping the file writer alive; hold it for the life of
/// the process.
pub fn init(level: u8, to_file: bool) -> Option<WorkerGuard> {
    let filter = match level {
        0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        _ => LevelFilter::ERROR,
    };
    if to_file {
        let appender = tracing_appender::rolling::daily("logs", "relayd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_max_level(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_max_level(filter).init();
        None
    }
}
