//! Format adapters: one per plugin ABI family, each implementing the
//! uniform contract in `crate::plugin`.

pub mod au;
pub mod clap;
pub mod vst3;

pub use au::AuPluginFormat;
pub use clap::ClapPluginFormat;
pub use vst3::Vst3PluginFormat;
