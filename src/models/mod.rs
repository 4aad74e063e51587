pub mod document;
pub mod presence;
pub mod messages;
pub mod health;
pub mod diagnostics;
pub mod doc_snapshot;
pub mod doc_delete;
pub mod error;

pub use document::*;
pub use presence::*;
pub use messages::*;
pub use health::*;
pub use diagnostics::*;
pub use doc_snapshot::*;
pub use doc_delete::*;
pub use error::*;
