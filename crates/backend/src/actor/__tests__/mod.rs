pub(crate) mod helpers;
mod scheduler;
mod watcher;
