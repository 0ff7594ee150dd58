#![warn(clippy::pedantic)]

mod config;
mod demo;

use anyhow::Result as AnyResult;

fn main() -> AnyResult<()> {
    let has_term = std::io::IsTerminal::is_terminal(&std::io::stdin());
    // Log to a terminal, if available. Else, log to "log.out" in the working directory.
    if has_term {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        let _ = simple_logging::log_to_file("log.out", log::LevelFilter::Debug);
    }

    // The only argument is an optional settings file.
    let path: Option<std::path::PathBuf> = std::env::args_os().nth(1).map(Into::into);
    let settings = config::Settings::load(path.as_deref())?;
    log::debug!("{settings:?}");

    let summary = demo::run(&settings)?;
    log::info!(
        "{} strokes, history depth {}, {} tiles swapped out, {} saved",
        summary.strokes,
        summary.history_depth,
        summary.swapped_out,
        human_bytes::human_bytes(summary.saved_bytes as f64),
    );
    Ok(())
}
