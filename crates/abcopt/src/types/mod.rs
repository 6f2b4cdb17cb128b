//! Symbol and type model.

pub mod cache;
pub mod model;
pub mod name;
pub mod value;

pub use cache::{Builtins, MachineKind, TypeCache};
pub use model::{AbcId, Binding, Metadata, Method, MethodId, MethodKind, Type, TypeId, Typeref};
pub use name::{Name, Namespace};
pub use value::Value;
