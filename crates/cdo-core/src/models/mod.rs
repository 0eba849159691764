pub mod app;
pub mod branch;
pub mod changeset;
pub mod commit;
pub mod instance;
pub mod manifest;

pub use app::{
    AppConfig, BootstrapConfig, DomainFormats, HookConfig, InstallConfig, InstanceConfig,
    PackagingConfig,
};
pub use branch::{Branch, BranchKind};
pub use changeset::{AliasTarget, Change, ChangeAction, ChangeSet, RecordSet, ResourceRecord};
pub use commit::{Commit, CommitMetadata};
pub use instance::{InstanceDescription, InstanceFilter, InstanceState, Status};
pub use manifest::{ServiceManifest, is_valid_service_name};
