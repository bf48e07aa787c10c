//! This module defines the main functionality of Carewatch, a camera-based home monitor.

pub mod module; // Import the module submodule that contains other modules
use crate::module::define; // Import the define module that contains constants and types
use crate::module::util::init::resource::init; // Import the resource initialization function

use std::str::FromStr;
use std::sync::mpsc;

// The main function of Carewatch
pub fn main() {
    // First argument overrides the data directory
    let root = std::env::args().nth(1);

    // Prepare the resources by initializing the property struct
    let property = match init(root.as_deref()) {
        Ok(property) => property,
        Err(e) => {
            eprintln!("Failed to initialize {}: {}", define::system::NAME, e);
            std::process::exit(1);
        }
    };

    // Initialize the logging system with the data directory and the system name
    let system = &property.conf.system;
    if let Err(e) = init_log(
        property.path.dir.data.as_str(),
        define::system::NAME,
        &system.log_level,
        system.log_console,
    ) {
        eprintln!("Failed to initialize logger: {}", e);
        std::process::exit(1);
    }
    log::info!("Starting Carewatch in {}", property.path.dir.data);

    // Commands from the console reach the detection thread through this channel
    let (tx, rx) = mpsc::channel();
    let _console_handler = module::com::console::listen(
        std::io::BufReader::new(std::io::stdin()),
        module::com::Controller::new(tx),
    );

    // Start the detection thread and wait for it to finish
    let pipeline_handler = module::pipeline::run(property, rx);
    match pipeline_handler.join() {
        Ok(Ok(summary)) => log::info!("Carewatch stopped: {:?}", summary),
        Ok(Err(e)) => {
            log::error!("Carewatch failed to start: {}", e);
            std::process::exit(1);
        }
        Err(_) => {
            log::error!("Detection thread panicked.");
            std::process::exit(1);
        }
    }
}

/// This function initializes the logger system using the log4rs crate.
///
/// # Arguments
/// * `dir` - A string slice that holds the directory where the log file will be stored
/// * `name` - A string slice that holds the name of the logger and the log file
/// * `level` - Root level name, `info` when it does not parse
/// * `console` - Whether to also log to stdout
///
/// # Log Example
/// ```
/// log::debug!("Debug Message"); // Log a debug message
/// log::info!("Info Message"); // Log an info message
/// log::warn!("Warning Message"); // Log a warning message
/// log::error!("Error Message"); // Log an error message
/// ```
fn init_log(
    dir: &str,
    name: &str,
    level: &str,
    console: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use crate::module::util::path::join;
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    const PATTERN: &str = "{h({d} - {l}: {m}{n})}";

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(join(&[dir, define::path::LOG_DIR, &format!("{}.log", name)]))?;

    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let mut builder =
        Config::builder().appender(Appender::builder().build("logfile", Box::new(logfile)));
    let mut root = Root::builder().appender("logfile");
    if console {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root = root.appender("stdout");
    }
    let config = builder.build(root.build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}
