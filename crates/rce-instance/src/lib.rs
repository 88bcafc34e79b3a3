//! RCE Instance - local instance management
//!
//! Installs product packages into installation directories and runs
//! instances on profile directories. A running instance holds an exclusive
//! lock on `instance.lock` in its profile; management operations hold a
//! second lock (`instancemanagement.lock`) for their whole duration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────┐
//! │   InstanceManagementService     │  install, start, stop, configure, list
//! └───────┬───────────────┬─────────┘
//!         │               │
//!         ▼               ▼
//!  InstanceOperations   PackageSource ─► downloads/<version>.zip ─► installations/<id>
//!         │
//!  synchronized ─► releasing_locks ─► ProcessInstanceOperations ─► child processes
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod configuration;
pub mod error;
pub mod lock;
pub mod operations;
pub mod output;
pub mod package;
pub mod profile;
pub mod service;

pub use config::{DirectoryLayout, InstanceManagementConfig};
pub use configuration::{
    ConfigurationOperation, ConfigurationSequence, InstanceConfiguration, NetworkConnection,
    SshConnection,
};
pub use error::{
    InstanceConfigurationError, InstanceManagementError, InstanceOperationError, Result,
};
pub use lock::{is_profile_locked, ManagementLock, ManagementLockTable, ProfileLock};
pub use operations::{
    standard_chain, InstanceOperations, InstanceOutcome, OperationReport,
    ProcessInstanceOperations,
};
pub use output::{CollectingOutputReceiver, TextOutputReceiver, TracingOutputReceiver};
pub use package::{install_from_zip, HttpPackageSource, PackageSource};
pub use service::{
    InstallOutcome, InstallationPolicy, InstanceInfo, InstanceManagementService, ListScope,
    LOCAL_INSTALLATION_PREFIX, MASTER_INSTALLATION_ID,
};
