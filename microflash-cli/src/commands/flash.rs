//! Flash command implementation.

use {
    crate::{Cli, CliError, config::Config, probe::open_connection, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::debug,
    microflash::{BoardId, DeviceConnection, FlashDataSource, FlashKind, HexGenerationError, UsbHost},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Placeholder in image paths replaced by the normalized board ID.
const BOARD_PLACEHOLDER: &str = "{board}";

/// Images read from disk, chosen per board generation.
pub(crate) struct FileImages {
    partial: PathBuf,
    full: Option<PathBuf>,
}

impl FileImages {
    pub(crate) fn new(partial: &Path, full: Option<&Path>) -> Self {
        Self {
            partial: partial.to_path_buf(),
            full: full.map(Path::to_path_buf),
        }
    }

    fn read(template: &Path, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError> {
        let path = resolve_board_path(template, board);
        debug!("Reading image {}", path.display());
        fs::read(&path)
            .map_err(|e| HexGenerationError(format!("failed to read {}: {e}", path.display())))
    }
}

impl FlashDataSource for FileImages {
    fn partial_flash_data(&mut self, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError> {
        Self::read(&self.partial, board)
    }

    fn full_flash_data(&mut self, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError> {
        Self::read(
            self.full
                .as_deref()
                .unwrap_or(&self.partial),
            board,
        )
    }
}

/// Substitute the normalized board ID for `{board}` in `template`.
pub(crate) fn resolve_board_path(template: &Path, board: BoardId) -> PathBuf {
    let text = template.to_string_lossy();
    if text.contains(BOARD_PLACEHOLDER) {
        PathBuf::from(text.replace(
            BOARD_PLACEHOLDER,
            &board
                .normalize()
                .to_string(),
        ))
    } else {
        template.to_path_buf()
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

fn kind_label(kind: FlashKind) -> &'static str {
    match kind {
        FlashKind::Partial => "partial flash",
        FlashKind::Full => "full flash",
    }
}

/// Flash command implementation.
///
/// Returns the connection, still connected with serial running, so a
/// monitor can follow.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    image: &Path,
    hex: Option<&Path>,
    full: bool,
) -> Result<DeviceConnection<UsbHost>> {
    if !image
        .to_string_lossy()
        .contains(BOARD_PLACEHOLDER)
    {
        fs::metadata(image).with_context(|| format!("Cannot read image {}", image.display()))?;
    }

    let mut connection = open_connection(cli, config, false)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        if let Some(board) = connection.board_info() {
            eprintln!(
                "{} Connected to micro:bit {} ({})",
                style("✓").green(),
                board.id,
                board.id.version()
            );
        }
    }

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    };

    let mut source = FileImages::new(image, hex);
    let result = connection.flash(&mut source, !full, &mut |progress, kind| {
        pb.set_message(kind_label(kind));
        match progress {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some(fraction) => pb.set_position((fraction.clamp(0.0, 1.0) * 100.0) as u64),
            None => pb.finish_and_clear(),
        }
    });

    let kind = result.context("Flashing failed")?;
    if !cli.quiet {
        eprintln!(
            "{} Done ({})",
            style("🎉")
                .green()
                .bold(),
            kind_label(kind)
        );
    }
    Ok(connection)
}
