pub mod decision;
pub mod peer_registry;
pub mod persona;
pub mod runtime;
pub mod session;
pub mod tool;
pub mod voice;
pub mod workflow_engine;

pub use decision::*;
pub use peer_registry::*;
pub use persona::*;
pub use runtime::*;
pub use session::*;
pub use tool::*;
pub use voice::*;
pub use workflow_engine::*;
