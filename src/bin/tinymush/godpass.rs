use miette::{bail, IntoDiagnostic};
use tracing::info;

use tinymush::prelude::*;

use crate::Args;

/// Sets `#1`'s password in the durable store, then exits. Useful for
/// recovering a wizard account without booting the whole server.
pub fn run(config: &Config, args: &Args, password: &str) -> miette::Result<()> {
    let store = crate::common::open_store(config, args)?;

    let Some(mut god) = store.get_object(1).map_err(Error::from).into_diagnostic()? else {
        bail!("the store has no object #1; import a flatfile first");
    };

    let hash = auth::hash_password(password);
    god.set_attr(Attr::encode(A_PASS, 1, 0, &hash));

    store.put_object(&god).map_err(Error::from).into_diagnostic()?;

    info!("password for #1 updated");
    println!("Password for #1 ({}) has been set.", god.name);

    Ok(())
}
