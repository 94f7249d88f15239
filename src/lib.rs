pub mod archive;
pub mod conn;
pub mod events;
pub mod flatfile;
pub mod prelude;
pub mod queue;
pub mod serve;
pub mod telnet;
pub mod world;

pub use tinymush_core as core;
pub use tinymush_redb as store;
