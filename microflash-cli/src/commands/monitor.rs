//! Serial monitor command implementation.
//!
//! Shows the micro:bit's serial output and forwards keystrokes to it. The
//! library's serial reader thread delivers text as connection events; the
//! main thread renders them and polls the keyboard.

use {
    crate::{Cli, clear_interrupted_flag, config::Config, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    log::debug,
    microflash::{
        ConnectOptions, ConnectionEvent, ConnectionStatus, DeviceConnection, Traceback,
        TracebackScrollback, UsbHost, clean_monitor_text, format_monitor_output,
    },
    std::{
        fs::{File, OpenOptions},
        io::{self, IsTerminal, Write as _},
        path::PathBuf,
        time::Duration,
    },
};

/// Monitor settings.
#[derive(Debug, Clone, Default)]
pub(crate) struct MonitorOptions {
    /// Prefix lines with timestamps.
    pub timestamp: bool,
    /// Drop control characters.
    pub clean_output: bool,
    /// Append received text here.
    pub log_file: Option<PathBuf>,
}

impl MonitorOptions {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            timestamp: config.monitor.timestamp,
            ..Self::default()
        }
    }
}

/// What a keystroke does.
#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Send(Vec<u8>),
    ToggleTimestamp,
    Exit,
    Ignore,
}

/// Map a key press to bytes for the board's REPL.
///
/// Ctrl+] exits and Ctrl+T toggles timestamps; other control keys are
/// forwarded so Ctrl+C interrupts and Ctrl+D soft-reboots MicroPython.
fn key_action(key: KeyEvent) -> KeyAction {
    if key.kind == KeyEventKind::Release {
        return KeyAction::Ignore;
    }

    match (key.code, key.modifiers) {
        (KeyCode::Char(']'), KeyModifiers::CONTROL) => KeyAction::Exit,
        (KeyCode::Char('t'), KeyModifiers::CONTROL) => KeyAction::ToggleTimestamp,
        (KeyCode::Char(c), KeyModifiers::CONTROL) if c.is_ascii_alphabetic() => {
            KeyAction::Send(vec![(c.to_ascii_lowercase() as u8) & 0x1F])
        },
        (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
            let mut buf = [0u8; 4];
            KeyAction::Send(
                c.encode_utf8(&mut buf)
                    .as_bytes()
                    .to_vec(),
            )
        },
        (KeyCode::Enter, _) => KeyAction::Send(b"\r".to_vec()),
        (KeyCode::Backspace, _) => KeyAction::Send(vec![0x08]),
        (KeyCode::Tab, _) => KeyAction::Send(vec![0x09]),
        (KeyCode::Esc, _) => KeyAction::Send(vec![0x1B]),
        (KeyCode::Delete, _) => KeyAction::Send(b"\x1b[3~".to_vec()),
        (KeyCode::Up, _) => KeyAction::Send(b"\x1b[A".to_vec()),
        (KeyCode::Down, _) => KeyAction::Send(b"\x1b[B".to_vec()),
        (KeyCode::Right, _) => KeyAction::Send(b"\x1b[C".to_vec()),
        (KeyCode::Left, _) => KeyAction::Send(b"\x1b[D".to_vec()),
        _ => KeyAction::Ignore,
    }
}

/// Renders serial text for the terminal and spots tracebacks.
struct SerialPrinter {
    scrollback: TracebackScrollback,
    last_traceback: Option<Traceback>,
    at_line_start: bool,
    timestamp: bool,
    clean_output: bool,
}

impl SerialPrinter {
    fn new(timestamp: bool, clean_output: bool) -> Self {
        Self {
            scrollback: TracebackScrollback::new(),
            last_traceback: None,
            at_line_start: true,
            timestamp,
            clean_output,
        }
    }

    /// Terminal output for `text`, followed by a highlighted summary when it
    /// completes a new traceback.
    fn render(&mut self, text: &str) -> String {
        let traceback = self
            .scrollback
            .push(text);

        let shown = if self.clean_output {
            clean_monitor_text(text)
        } else {
            text.to_string()
        };
        let mut out = format_monitor_output(&shown, self.timestamp, &mut self.at_line_start);

        if traceback.is_some() && traceback != self.last_traceback {
            if let Some(tb) = &traceback {
                if !self.at_line_start {
                    out.push_str("\r\n");
                    self.at_line_start = true;
                }
                out.push_str(&traceback_summary(tb));
                out.push_str("\r\n");
            }
            self.last_traceback = traceback;
        }
        out
    }

    /// The program restarted: earlier output no longer applies.
    fn reset(&mut self) {
        self.scrollback
            .clear();
        self.last_traceback = None;
    }
}

fn traceback_summary(tb: &Traceback) -> String {
    let location = match (tb.file(), tb.line()) {
        (Some(file), Some(line)) => format!("{file} line {line}"),
        (Some(file), None) => file,
        (None, _) => "program".to_string(),
    };
    format!(
        "{} {}: {}",
        style("⚠").red(),
        style(location)
            .yellow()
            .bold(),
        style(&tb.error).red()
    )
}

/// Write monitor text: stderr in TTY mode, stdout otherwise.
fn emit(tty_mode: bool, text: &str) {
    if tty_mode {
        eprint!("{text}");
        io::stderr()
            .flush()
            .ok();
    } else {
        print!("{text}");
        io::stdout()
            .flush()
            .ok();
    }
}

/// Status lines always go to stderr, on a line of their own.
fn print_status_line(message: &str, tty_mode: bool) {
    if tty_mode {
        eprint!("\r\x1b[2K{message}\r\n");
    } else {
        eprintln!("{message}");
    }
    io::stderr()
        .flush()
        .ok();
}

/// Run the serial monitor until Ctrl+] / Ctrl-C or the board goes away.
pub(crate) fn cmd_monitor(
    cli: &Cli,
    _config: &Config,
    connection: &mut DeviceConnection<UsbHost>,
    options: &MonitorOptions,
) -> Result<()> {
    let events = connection.subscribe();
    // (re)starts the serial reader after subscribing so no output is missed
    connection.connect(ConnectOptions::default(), &mut |_| None)?;

    let interactive = io::stdin().is_terminal();
    let tty_mode = io::stdout().is_terminal() && io::stderr().is_terminal();

    if !cli.quiet {
        let board = connection
            .board_info()
            .map(|b| b.id.to_string())
            .unwrap_or_default();
        print_status_line(
            &format!(
                "{} Monitoring micro:bit {} at {} baud",
                style("📡").cyan(),
                style(board).green(),
                connection
                    .options()
                    .baud_rate
            ),
            tty_mode,
        );
        if interactive {
            print_status_line(
                &style("Ctrl+] to exit, Ctrl+T toggles timestamps")
                    .dim()
                    .to_string(),
                tty_mode,
            );
        }
    }

    let mut log = match &options.log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?,
        ),
        None => None,
    };

    let raw_guard = if interactive {
        crossterm::terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Some(RawModeGuard)
    } else {
        None
    };

    let mut printer = SerialPrinter::new(options.timestamp, options.clean_output);
    let result = monitor_loop(connection, &events, &mut printer, &mut log, interactive, tty_mode);

    drop(raw_guard);
    connection.disconnect();
    clear_interrupted_flag();
    if !cli.quiet {
        print_status_line(&format!("{} Monitor closed", style("👋").cyan()), tty_mode);
    }
    result
}

fn monitor_loop(
    connection: &mut DeviceConnection<UsbHost>,
    events: &std::sync::mpsc::Receiver<ConnectionEvent>,
    printer: &mut SerialPrinter,
    log: &mut Option<File>,
    interactive: bool,
    tty_mode: bool,
) -> Result<()> {
    loop {
        if was_interrupted() {
            debug!("Monitor interrupted");
            return Ok(());
        }

        for event in events.try_iter() {
            match event {
                ConnectionEvent::SerialData(text) => {
                    if let Some(file) = log {
                        let _ = file.write_all(text.as_bytes());
                    }
                    emit(tty_mode, &printer.render(&text));
                },
                ConnectionEvent::SerialReset => printer.reset(),
                ConnectionEvent::SerialError(e) => {
                    return Err(anyhow::Error::new(e).context("Serial connection lost"));
                },
                ConnectionEvent::Status(
                    status @ (ConnectionStatus::NoAuthorizedDevice | ConnectionStatus::NotConnected),
                ) => {
                    print_status_line(
                        &format!("{} micro:bit {status}", style("⚠").yellow()),
                        tty_mode,
                    );
                    return Ok(());
                },
                ConnectionEvent::Status(_) | ConnectionEvent::Flash(_) => {},
            }
        }

        connection.poll();

        if !interactive {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        match key_action(key) {
            KeyAction::Exit => return Ok(()),
            KeyAction::ToggleTimestamp => {
                printer.timestamp = !printer.timestamp;
                let state = if printer.timestamp {
                    "Timestamps on"
                } else {
                    "Timestamps off"
                };
                print_status_line(&format!("{} {state}", style("⏱").cyan()), tty_mode);
                printer.at_line_start = true;
            },
            KeyAction::Send(bytes) => connection.serial_write(&bytes)?,
            KeyAction::Ignore => {},
        }
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}
