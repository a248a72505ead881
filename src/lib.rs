pub mod format;
pub mod interrupt;
pub mod invoke;
pub mod obfuscate;
pub mod registry;
pub mod unpack;
pub mod workspace;

pub use format::{detect, FormatId};
pub use interrupt::InterruptFlag;
pub use obfuscate::{ObfuscateOptions, ObfuscateReport, Obfuscator};
pub use registry::ContentRegistry;
pub use unpack::{UnpackOptions, UnpackReport, Unpacker};
