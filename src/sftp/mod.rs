//! SFTP file management module
//!
//! Remote file browsing and chunked transfers over the SFTP subsystem.

pub mod backend;
pub mod error;
pub mod path_utils;
pub mod progress;
pub mod session;
pub mod transfer;
pub mod types;

pub use backend::{RemoteDirEntry, RemoteFs, RusshFs};
pub use error::SftpError;
pub use progress::{observe, ProgressFn, TransferProgress};
pub use session::{RemoveOutcome, SftpChannel};
pub use transfer::{CancelFlag, TransferCoordinator, TransferError, TransferTask, UploadSource};
pub use types::*;
