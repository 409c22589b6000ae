pub mod descriptor;
pub mod initializer;
pub mod locks;
pub mod manager;
pub mod package;
pub mod record;
pub mod registry;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use descriptor::{CapabilityDeclaration, DescriptorParser, PluginDescriptor};
pub use initializer::{InitReport, SystemInitializer};
pub use manager::{OperationContext, PluginManager, RecoveryReport};
pub use package::{FsPackageStore, PackageHandle, PackageSource, PackageStore};
pub use record::{PluginRecord, PluginState};
pub use registry::{PluginRegistry, SqlitePluginRegistry};
pub use runtime::{DefaultRuntimeFactory, RuntimeFactory, RuntimeSpec, RuntimeUnit};
