pub mod manager;
pub mod realtime;
pub mod reconciler;
pub mod session;
pub mod snapshot;
pub mod source;
pub mod views;

pub use manager::*;
pub use realtime::*;
pub use reconciler::*;
pub use session::*;
pub use snapshot::*;
pub use source::*;
pub use views::*;
