//! Runtime configuration. Settings are passed as an explicit [`Config`]
//! value to the server constructor, never held as process globals.
//!
//! Precedence: CLI flag > `MUSH_*` environment variable > YAML file >
//! built-in default. Environment only wins when the matching flag was
//! not given, which the loader guarantees by applying explicit
//! overrides last.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::Dbref;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shown in the login banner and recorded in archive manifests.
    pub mud_name: String,

    /// Cleartext TCP port.
    pub port: u16,

    /// Seconds of silence before a descriptor is dropped. Zero means
    /// never for connected descriptors; the login state always times
    /// out.
    pub idle_timeout: u64,

    pub tls: bool,
    pub tls_port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Allow the plain listener alongside TLS.
    pub cleartext: bool,

    pub data_dir: PathBuf,
    pub text_dir: Option<PathBuf>,
    pub dict_dir: Option<PathBuf>,

    pub archive_dir: PathBuf,
    /// Minutes between automatic archives. Zero disables the job.
    pub archive_interval: u64,
    /// How many archives to keep before pruning the oldest.
    pub archive_retain: usize,

    pub web_enabled: bool,
    pub web_port: u16,

    /// The admin API listens on its own port, never on the game
    /// transports.
    pub admin_enabled: bool,
    pub admin_port: u16,

    pub comsys_enabled: bool,
    pub mail_enabled: bool,
    /// Days before unread mail expires.
    pub mail_expiration: u64,

    pub function_invocation_limit: u64,
    pub output_limit: usize,
    pub max_retries: u32,

    pub spellcheck_enabled: bool,

    pub sql_enabled: bool,
    pub sql_database: Option<PathBuf>,
    pub sql_query_limit: usize,
    pub sql_timeout: u64,

    pub starting_money: i64,
    pub paycheck: i64,
    pub player_starting_room: Dbref,
    pub default_home: Dbref,
    pub master_room: Dbref,

    /// Fill zero object timestamps with wall clock when writing a
    /// flatfile. The substitution is lossy, so it can be turned off.
    pub flatfile_stamp_timestamps: bool,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mud_name: "TinyMUSH".to_owned(),
            port: 6250,
            idle_timeout: 3600,
            tls: false,
            tls_port: 6251,
            tls_cert: None,
            tls_key: None,
            cleartext: true,
            data_dir: PathBuf::from("./data"),
            text_dir: None,
            dict_dir: None,
            archive_dir: PathBuf::from("./archives"),
            archive_interval: 0,
            archive_retain: 10,
            web_enabled: false,
            web_port: 8000,
            admin_enabled: false,
            admin_port: 8001,
            comsys_enabled: true,
            mail_enabled: true,
            mail_expiration: 14,
            function_invocation_limit: 25_000,
            output_limit: 16_384,
            max_retries: 3,
            spellcheck_enabled: false,
            sql_enabled: false,
            sql_database: None,
            sql_query_limit: 5_000,
            sql_timeout: 10,
            starting_money: 100,
            paycheck: 50,
            player_starting_room: 0,
            default_home: 0,
            master_room: 2,
            flatfile_stamp_timestamps: true,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub max_level: Option<String>,
    pub include_web: bool,
}

impl Config {
    /// Loads configuration from an optional YAML file, `MUSH_*`
    /// environment variables, and explicit CLI overrides, in that
    /// precedence order (later sources win).
    pub fn load(
        file: Option<&std::path::Path>,
        overrides: &[(&str, String)],
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix("MUSH").try_parsing(true));

        for (key, value) in overrides {
            builder = builder.set_override(*key, value.clone())?;
        }

        builder.build()?.try_deserialize()
    }
}
