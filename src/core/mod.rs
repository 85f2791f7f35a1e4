pub mod error;
pub mod key;
pub mod value;

pub use error::{CommandError, Result, StateError};
pub use key::{ScopeKind, StateKey};
pub use value::{FieldMap, FieldSpec, FieldType};
