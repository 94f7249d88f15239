use clap::Parser;
use miette::Result;
use std::path::PathBuf;

mod common;
mod daemon;
mod feedback;
mod godpass;
mod restore;

#[derive(Debug, Parser)]
#[clap(name = "TinyMUSH")]
#[clap(bin_name = "tinymush")]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Legacy flatfile to import from (required only when the durable
    /// store is empty)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Durable store path (auto-detected in the data dir if absent)
    #[arg(long)]
    pub bolt: Option<PathBuf>,

    /// YAML config file
    #[arg(long)]
    pub conf: Option<PathBuf>,

    /// Force a re-import from the flatfile
    #[arg(long, action)]
    pub import: bool,

    /// Wipe the durable store and re-import
    #[arg(long, action)]
    pub fresh: bool,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    #[arg(long)]
    pub tls_port: Option<u16>,

    /// Directory of text files served by the game
    #[arg(long)]
    pub textdir: Option<PathBuf>,

    /// Directory of spellcheck dictionaries
    #[arg(long)]
    pub dictdir: Option<PathBuf>,

    /// Legacy-style alias/compat config file
    #[arg(long)]
    pub aliasconf: Option<PathBuf>,

    /// Comsys sidecar flatfile to import channels from
    #[arg(long)]
    pub comsysdb: Option<PathBuf>,

    /// Auxiliary SQL database file
    #[arg(long)]
    pub sqldb: Option<PathBuf>,

    /// Restore an archive before booting
    #[arg(long)]
    pub restore: Option<PathBuf>,

    /// Set #1's password, then exit
    #[arg(long)]
    pub godpass: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = common::load_config(&args)?;

    common::setup_tracing(&config.logging)?;

    if let Some(password) = &args.godpass {
        return godpass::run(&config, &args, password);
    }

    if let Some(archive) = &args.restore {
        restore::run(&config, &args, archive)?;
    }

    daemon::run(config, &args)
}
