//! Remote-repository operations.

pub mod backend;
pub mod remote;

pub use backend::RepoBackend;
pub use remote::{RemoteSettings, RemoteSync, RepositoryHandle, STATE_DIR};
