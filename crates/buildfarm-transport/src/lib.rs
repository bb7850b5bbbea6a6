//! Backends for the build farm's external collaborators.
//!
//! Supported backends:
//! - HTTP/JSON worker RPC, with a command-based VM reset action
//! - HTTP and filesystem librarians
//! - Log and webhook notifiers

pub mod librarian;
pub mod notify;
pub mod rpc;

pub use librarian::{FsLibrarian, HttpLibrarian};
pub use notify::{LogNotifier, WebhookNotifier};
pub use rpc::{HttpTransportFactory, HttpWorkerClient, TransportSettings};
