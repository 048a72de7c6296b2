pub mod chain;
pub mod check;
pub mod hash;
pub mod relay;
pub mod serde;
pub mod session;

pub use chain::*;
pub use check::*;
pub use hash::*;
pub use relay::*;
pub use session::*;

