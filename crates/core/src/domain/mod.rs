pub mod agent;
pub mod analysis;
pub mod session;
pub mod todo;

pub use agent::*;
pub use analysis::*;
pub use session::*;
pub use todo::*;
