//! microflash CLI - Command-line tool for programming BBC micro:bit boards.
//!
//! ## Features
//!
//! - List attached micro:bits with their board version
//! - Partial flashing that only rewrites changed pages
//! - Full flashing through DAPLink
//! - Serial console with MicroPython traceback highlighting
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod probe;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and colors should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Returns true once Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Failures with their own exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or unusable environment (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// microflash - Program BBC micro:bit boards over USB.
///
/// Environment variables:
///   MICROFLASH_PROBE            - Probe to use (bus:address or serial number prefix)
///   MICROFLASH_BAUD             - Serial baud rate (default: 115200)
///   MICROFLASH_NON_INTERACTIVE  - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "microflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Probe to use: `bus:address` or a serial number prefix.
    #[arg(short, long, global = true, env = "MICROFLASH_PROBE")]
    probe: Option<String>,

    /// Serial baud rate [default: 115200].
    #[arg(short, long, global = true, env = "MICROFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "MICROFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List attached micro:bits.
    List {
        /// Output the list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Connect to a micro:bit and show its identity and flash layout.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Program a micro:bit.
    ///
    /// Paths may contain `{board}`, which is replaced by the board ID
    /// (9900 for V1, 9903 for V2).
    Flash {
        /// Raw binary image, loaded at address 0.
        image: PathBuf,

        /// Image handed to DAPLink for a full flash (defaults to IMAGE).
        #[arg(long, value_name = "PATH")]
        hex: Option<PathBuf>,

        /// Skip the partial flash attempt.
        #[arg(long)]
        full: bool,

        /// Open the serial monitor after flashing.
        #[arg(long)]
        monitor: bool,
    },

    /// Open the serial console.
    Monitor {
        /// Prefix each line with a timestamp.
        #[arg(long)]
        timestamp: bool,

        /// Drop control characters from the output.
        #[arg(long)]
        clean_output: bool,

        /// Append received text to a file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("microflash v{} (verbose level: {})", env!("CARGO_PKG_VERSION"), cli.verbose);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    microflash::set_interrupt_checker(was_interrupted);

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::List { json } => commands::list::cmd_list(&config, *json),
        Commands::Info { json } => commands::info::cmd_info(&cli, &config, *json),
        Commands::Flash {
            image,
            hex,
            full,
            monitor,
        } => {
            let full = *full || config.flash.full;
            let mut connection =
                commands::flash::cmd_flash(&cli, &config, image, hex.as_deref(), full)?;
            if *monitor {
                eprintln!();
                commands::monitor::cmd_monitor(
                    &cli,
                    &config,
                    &mut connection,
                    &commands::monitor::MonitorOptions::from_config(&config),
                )?;
            } else {
                connection.disconnect();
            }
            Ok(())
        },
        Commands::Monitor {
            timestamp,
            clean_output,
            log_file,
        } => {
            let options = commands::monitor::MonitorOptions {
                timestamp: *timestamp || config.monitor.timestamp,
                clean_output: *clean_output,
                log_file: log_file.clone(),
            };
            let mut connection = probe::open_connection(&cli, &config, false)?;
            commands::monitor::cmd_monitor(&cli, &config, &mut connection, &options)
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: microflash completions bash".to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from(["microflash", "flash", "app-{board}.bin"]).unwrap();
        match cli.command {
            Commands::Flash {
                image,
                hex,
                full,
                monitor,
            } => {
                assert_eq!(image, PathBuf::from("app-{board}.bin"));
                assert!(hex.is_none());
                assert!(!full);
                assert!(!monitor);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "microflash",
            "flash",
            "app.bin",
            "--hex",
            "app.hex",
            "--full",
            "--monitor",
            "--probe",
            "001:004",
        ])
        .unwrap();
        assert_eq!(cli.probe.as_deref(), Some("001:004"));
        match cli.command {
            Commands::Flash {
                hex, full, monitor, ..
            } => {
                assert_eq!(hex, Some(PathBuf::from("app.hex")));
                assert!(full);
                assert!(monitor);
            },
            _ => panic!("expected flash"),
        }
    }

    #[test]
    fn test_cli_parse_monitor() {
        let cli = Cli::try_parse_from(["microflash", "monitor", "--timestamp", "-b", "9600"])
            .unwrap();
        assert_eq!(cli.baud, Some(9600));
        assert!(matches!(
            cli.command,
            Commands::Monitor {
                timestamp: true,
                clean_output: false,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_list_json() {
        let cli = Cli::try_parse_from(["microflash", "list", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::List { json: true }));
    }

    #[test]
    fn test_cli_verbosity() {
        let cli = Cli::try_parse_from(["microflash", "-vv", "info"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["microflash"]).is_err());
    }

    #[test]
    fn test_cli_flash_requires_image() {
        assert!(Cli::try_parse_from(["microflash", "flash"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
