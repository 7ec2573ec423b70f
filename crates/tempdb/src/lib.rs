//! Disposable PostgreSQL instances for tests
//!
//! Finds a local PostgreSQL installation, initializes a throwaway cluster in
//! a private directory, starts a server that listens only on a Unix socket
//! inside that directory, and hands out connection URIs for databases
//! created on it. Closing the instance stops the server and deletes the
//! directory.
//!
//! # Features
//!
//! - `pg-tests`: Enable end-to-end tests that start real servers
//!
//! # Usage
//!
//! ```rust,ignore
//! use tempdb::{find_installation, InstanceFactory, Result};
//!
//! let bin_dir = find_installation(None)?.expect("no matching installation");
//! let factory = InstanceFactory::new(bin_dir, None)?;
//!
//! let mut instance = factory.provision_and_start().await?;
//! let db = instance.create_database("app_test", None).await?;
//! println!("{}", db.dsn()); // postgresql://me@%2Ftmp%2Ftempdb-x1y2/app_test
//!
//! instance.close().await?;
//! ```

#[cfg(not(unix))]
compile_error!("tempdb needs Unix sockets and POSIX signals");

pub mod config;
pub mod discover;
mod error;
pub mod factory;
pub mod instance;
pub mod sql;
pub mod uri;
pub mod version;

pub use config::TempDbConfig;
pub use discover::{
    find_installation, iter_installations, Discovery, HostSystem, Installation, Platform,
    SystemProbe,
};
pub use error::{Result, TempDbError};
pub use factory::{InstanceFactory, ServerParams};
pub use instance::{DatabaseHandle, RunningInstance};
pub use uri::{ParamValue, Params, Uri, UriOverrides};
pub use version::Version;
