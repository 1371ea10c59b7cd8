pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubLoader, StubModel};

#[cfg(feature = "backend-tract")]
pub use tract::{TractLoader, TractModel};
