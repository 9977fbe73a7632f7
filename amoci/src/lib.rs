pub mod client;
pub mod reference;
pub mod walk;

pub use client::{RegistryAuth, RegistryClient, RegistryError};
pub use reference::{ImageReference, ReferenceError, Scheme};
pub use walk::{WalkItem, WalkItemKind, walk};
