pub mod health;
pub mod diagnostics;
pub mod doc_snapshot;
pub mod doc_delete;
pub mod ws;

pub use health::*;
pub use diagnostics::*;
pub use doc_snapshot::*;
pub use doc_delete::*;
pub use ws::*;
