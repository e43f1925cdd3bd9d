use crate::app::cli::args::Args;
use crate::app::cli::config::{LogSettings, Settings};
use crate::app::commands::{run_command, CommandContext};
use crate::app::error::{AppError, AppResult, EXIT_FAILURE};
use crate::broker::api::InMemoryBroker;
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::{adjust_level, init_logging};
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::EventBus;
use clap::{CommandFactory, Parser};
use std::io::IsTerminal;
use std::sync::Arc;

/// Parse the command line, set up logging and run the selected command
///
/// Returns the process exit code.
pub async fn startup() -> i32 {
    let args = Args::parse();

    // Settings come first so the log configuration can live in the file;
    // a broken configuration is still reported with the command-line logging.
    let loaded = Settings::load(&args).await;
    let logging = match &loaded {
        Ok(settings) => settings.logging.clone(),
        Err(_) => {
            let mut fallback = Settings::default();
            fallback.apply_args(&args);
            fallback.logging
        }
    };
    if let Err(e) = configure_logging(&logging, &args) {
        eprintln!("{}", e);
        return EXIT_FAILURE;
    }

    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            let e = AppError::from(e);
            log_error_with_context(&e, "Loading configuration");
            return e.exit_code();
        }
    };

    let Some(command) = args.command.as_ref() else {
        if let Err(e) = Args::command().print_help() {
            log::error!("Could not print help: {}", e);
            return EXIT_FAILURE;
        }
        return 0;
    };

    log::debug!("{} {} starting", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    log::trace!("Settings: {:#?}", settings);

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();
    let ctx = CommandContext {
        settings,
        broker: Arc::new(InMemoryBroker::new()),
        events: EventBus::new(),
        shutdown,
    };

    match run_command(&ctx, command).await {
        Ok(()) => 0,
        Err(e) => {
            log_error_with_context(&e, "Command failed");
            e.exit_code()
        }
    }
}

fn configure_logging(logging: &LogSettings, args: &Args) -> AppResult<()> {
    let use_color = logging
        .color
        .unwrap_or_else(|| std::io::stdout().is_terminal());
    colored::control::set_override(use_color);

    let level = adjust_level(&logging.level, args.verbose, args.quiet);
    let file = logging
        .file
        .as_ref()
        .map(|path| path.to_string_lossy().into_owned());
    init_logging(
        Some(&level),
        Some(&logging.format),
        file.as_deref(),
        use_color,
    )
    .map_err(|e| AppError::Logging {
        message: e.to_string(),
    })
}
