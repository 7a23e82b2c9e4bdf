pub mod notifier;
pub mod order_watcher;

pub use notifier::{NotificationManager, NotifierError, NotifierHandle, RouterCommand};
pub use order_watcher::{OrderChangeWatcher, RetryPolicy, SnapshotView, WatcherError};
