use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt as _;
use miette::{bail, Context as _, IntoDiagnostic};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tinymush::archive::ArchiveJob;
use tinymush::prelude::*;
use tinymush::queue::{KernelExecutor, QueueRunner};
use tinymush::world::World;
use tinymush::{flatfile, serve};
use tinymush_redb::MushStore;

use crate::feedback::{Feedback, ProgressReader};
use crate::Args;

/// Seconds of warning players get when the process receives a signal.
const SIGNAL_SHUTDOWN_GRACE: u64 = 10;

#[tokio::main]
pub async fn run(config: Config, args: &Args) -> miette::Result<()> {
    let feedback = Feedback::default();

    if args.fresh {
        let path = crate::common::store_path(&config, args);
        if path.exists() {
            let confirmed = inquire::Confirm::new(&format!(
                "--fresh will wipe the durable store at {}. Continue?",
                path.display()
            ))
            .with_default(false)
            .prompt()
            .unwrap_or(false);

            if !confirmed {
                bail!("aborted by operator");
            }

            warn!(path = %path.display(), "wiping durable store for fresh import");
            std::fs::remove_file(&path)
                .into_diagnostic()
                .context("removing store file")?;
        }
    }

    let store = crate::common::open_store(&config, args)?;

    if !store.has_data().map_err(Error::from).into_diagnostic()? || args.import || args.fresh {
        let Some(flatfile_path) = &args.db else {
            bail!("the durable store is empty and no flatfile was given; pass --db <path>");
        };
        import_flatfile(&store, flatfile_path, &feedback)?;
    }

    let mut db = store.load_all().map_err(Error::from).into_diagnostic()?;

    let repairs = db.check_contents();
    if repairs > 0 {
        warn!(repairs, "repaired broken chains at boot");
    }

    if config.comsys_enabled {
        load_comsys(&store, &mut db, args.comsysdb.as_deref())?;
    }

    info!(
        objects = db.object_count(),
        players = db.players.len(),
        mud_name = %config.mud_name,
        "world loaded"
    );

    let archive_job = build_archive_job(&config, args, db.object_count() as u64);
    let (world, queue_rx) = World::new(db, store.clone(), config);

    let exit = CancellationToken::new();

    let runner = QueueRunner::new(
        world.clone(),
        queue_rx,
        Box::new(KernelExecutor),
        exit.clone(),
    )
    .with_archive_hook(Box::new(move |world: &World| {
        let mut job = archive_job.clone();
        job.objects = world.db.read().expect("db lock poisoned").object_count() as u64;
        let store = world.store.clone();

        tinymush::archive::create(
            &job,
            &|staged: &Path| {
                store
                    .backup(staged)
                    .map_err(|e| ArchiveError::Io(std::io::Error::other(e.to_string())))
            },
            None,
        )
        .map_err(Error::from)
    }));

    let runner_task = tokio::spawn(runner.run());

    let drivers = FuturesUnordered::new();
    serve::load_drivers(&drivers, world.clone(), exit.clone());

    let signal_world = world.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("signal received, shutting down");
            signal_world.shutdown(SIGNAL_SHUTDOWN_GRACE);
        }
    });

    exit.cancelled().await;

    let mut drivers = drivers;
    while let Some(result) = drivers.next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "driver exited with error"),
            Err(e) => error!(error = %e, "driver task panicked"),
        }
    }

    let _ = runner_task.await;

    info!("server stopped");
    Ok(())
}

fn import_flatfile(store: &MushStore, path: &Path, feedback: &Feedback) -> miette::Result<()> {
    let size = std::fs::metadata(path)
        .into_diagnostic()
        .with_context(|| format!("reading {}", path.display()))?
        .len();

    let pb = feedback.flatfile_bar(size);
    pb.set_message("importing flatfile");

    let file = std::fs::File::open(path).into_diagnostic()?;
    let reader = std::io::BufReader::new(ProgressReader::new(file, pb.clone()));

    let db = flatfile::read(reader)
        .map_err(Error::from)
        .into_diagnostic()
        .context("parsing flatfile")?;

    store
        .import_from_database(&db)
        .map_err(Error::from)
        .into_diagnostic()
        .context("importing into store")?;

    pb.finish_with_message(format!("imported {} objects", db.object_count()));
    Ok(())
}

/// Lazily seeds the comsys tables from the sidecar flatfile the first
/// time the server runs with comsys enabled.
fn load_comsys(store: &MushStore, db: &mut Database, path: Option<&Path>) -> miette::Result<()> {
    let has_data = store
        .has_comsys_data()
        .map_err(Error::from)
        .into_diagnostic()?;

    if has_data {
        for channel in store.load_channels().map_err(Error::from).into_diagnostic()? {
            db.channels.insert(channel.name.to_lowercase(), channel);
        }
        for alias in store
            .load_chan_aliases()
            .map_err(Error::from)
            .into_diagnostic()?
        {
            db.chan_aliases
                .insert(composite_key(alias.player, &alias.alias), alias);
        }
        return Ok(());
    }

    let Some(path) = path else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let file = std::fs::File::open(path).into_diagnostic()?;
    let data = flatfile::comsys::read(std::io::BufReader::new(file))
        .map_err(Error::from)
        .into_diagnostic()
        .context("parsing comsys flatfile")?;

    info!(
        channels = data.channels.len(),
        aliases = data.aliases.len(),
        "imported comsys data"
    );

    for channel in &data.channels {
        store
            .put_channel(channel)
            .map_err(Error::from)
            .into_diagnostic()?;
    }
    for alias in &data.aliases {
        store
            .put_chan_alias(alias)
            .map_err(Error::from)
            .into_diagnostic()?;
    }

    data.apply(db);
    Ok(())
}

fn build_archive_job(config: &Config, args: &Args, objects: u64) -> ArchiveJob {
    let mut conf_files = Vec::new();
    if let Some(conf) = &args.conf {
        conf_files.push(conf.clone());
    }
    if let Some(aliasconf) = &args.aliasconf {
        conf_files.push(aliasconf.clone());
    }

    ArchiveJob {
        archive_dir: config.archive_dir.clone(),
        server: format!("tinymush {}", env!("CARGO_PKG_VERSION")),
        mud_name: config.mud_name.clone(),
        objects,
        store_name: "game.redb".to_owned(),
        sql_path: config.sql_enabled.then(|| {
            args.sqldb
                .clone()
                .or_else(|| config.sql_database.clone())
                .unwrap_or_else(|| config.data_dir.join("game.sqldb"))
        }),
        dict_dir: config.dict_dir.clone(),
        text_dir: config.text_dir.clone(),
        conf_files,
        retain: config.archive_retain,
    }
}

