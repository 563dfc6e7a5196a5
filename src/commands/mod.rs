mod check;
mod run;

pub use check::check;
pub use run::run;

use std::io::Write;

/// Initialise logging to stdout so status lines interleave with service output
///
/// An explicit level wins over `RUST_LOG`; otherwise `RUST_LOG` wins over
/// the `info` default.
pub fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }

    builder
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let level = record.level().as_str().to_lowercase();
            for line in record.args().to_string().lines() {
                writeln!(buf, " ({}) {}", level, line)?;
            }
            Ok(())
        })
        .init();
}
