use miette::{Context as _, IntoDiagnostic};
use std::path::Path;
use tracing::info;

use tinymush::archive::{self, RestoreOptions};
use tinymush::prelude::*;

use crate::Args;

/// Pre-boot restore: unpack an archive into the configured data
/// directories, resolving config conflicts on the operator's terminal.
pub fn run(config: &Config, args: &Args, archive_path: &Path) -> miette::Result<()> {
    let opts = RestoreOptions {
        data_dir: config.data_dir.clone(),
        conf_dir: args
            .conf
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.data_dir.join("conf")),
        dict_dir: config.dict_dir.clone(),
        text_dir: config.text_dir.clone(),
    };

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    let summary = archive::restore(archive_path, &opts, stdin.lock(), stdout.lock())
        .map_err(Error::from)
        .into_diagnostic()
        .with_context(|| format!("restoring {}", archive_path.display()))?;

    info!(
        restored = summary.restored.len(),
        skipped = summary.skipped.len(),
        "archive restored"
    );

    Ok(())
}
