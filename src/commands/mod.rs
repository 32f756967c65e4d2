pub mod context;
pub mod identities;
pub mod publish;
pub mod resolver;
pub mod status;
pub mod worker;

pub use context::AppContext;
pub use identities::seed_identities;
pub use publish::{publish, QueueKind};
pub use resolver::resolver;
pub use status::status;
pub use worker::worker;
