pub mod hash;
pub mod sibling;
pub mod sibling_set;
pub mod update_batch;
pub mod version;

pub use hash::Hash;
pub use sibling::Sibling;
pub use sibling_set::SiblingSet;
pub use update_batch::{Update, UpdateBatch, UpdateOp};
pub use version::{Dot, Dvv, VersionVector};
