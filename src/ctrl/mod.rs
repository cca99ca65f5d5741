/// TCP-based connection builder.
mod connecter;

pub use connecter::{Connecter, Role};
