//! Notification-driven cache coherence.
//!
//! A trigger on each cached table publishes a [`RowOperation`] on a
//! LISTEN/NOTIFY channel. [`CacheCoordinator::subscribe`] listens on that
//! channel and hands each decoded change to an [`OperationHandler`], which
//! updates or evicts entries in a [`CacheStore`].

pub mod cache;
pub mod coordinator;
pub mod operation;

pub use cache::{CacheStore, LruCacheStore};
pub use coordinator::{CacheCoordinator, Notification, NotificationSource, OperationHandler, Subscription};
pub use operation::RowOperation;
