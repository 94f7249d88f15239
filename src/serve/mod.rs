use futures_util::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::prelude::*;
use crate::world::World;

pub mod admin;
pub mod telnet;
pub mod web;

/// Spawns every configured driver into the caller's task set. Each
/// driver owns its listeners and exits when the token fires.
pub fn load_drivers(
    all_drivers: &FuturesUnordered<tokio::task::JoinHandle<Result<(), ServeError>>>,
    world: World,
    exit: CancellationToken,
) {
    let config = world.config.clone();

    if config.cleartext || config.tls {
        info!(
            port = config.port,
            tls = config.tls,
            "starting telnet driver"
        );

        let cfg = telnet::Config::from_core(&config);
        let driver = <telnet::Driver as Driver<World, CancelTokenImpl>>::run(
            cfg,
            world.clone(),
            CancelTokenImpl(exit.clone()),
        );

        all_drivers.push(tokio::spawn(driver));
    }

    if config.web_enabled {
        info!(port = config.web_port, "starting web driver");

        let cfg = web::Config {
            listen_address: format!("0.0.0.0:{}", config.web_port),
        };
        let driver = <web::Driver as Driver<World, CancelTokenImpl>>::run(
            cfg,
            world.clone(),
            CancelTokenImpl(exit.clone()),
        );

        all_drivers.push(tokio::spawn(driver));
    }

    // the admin task always gets its own listener; it must never ride
    // on a game-facing port
    if config.admin_enabled {
        info!(port = config.admin_port, "starting admin driver");

        let cfg = admin::Config {
            listen_address: format!("127.0.0.1:{}", config.admin_port),
        };
        let driver = <admin::Driver as Driver<World, CancelTokenImpl>>::run(
            cfg,
            world.clone(),
            CancelTokenImpl(exit.clone()),
        );

        all_drivers.push(tokio::spawn(driver));
    }
}
