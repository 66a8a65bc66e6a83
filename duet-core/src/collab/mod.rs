//! CRDT side of the editor: the yrs mirror and the binding that keeps it in
//! step with the local tree.

pub mod binding;
pub mod mirror;
pub mod reconcile;

pub use binding::{Binding, LOCAL_ORIGIN, REMOTE_ORIGIN};
pub use mirror::Mirror;
