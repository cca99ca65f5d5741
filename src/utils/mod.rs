/// Common trait impls for `NonNull`-wrapped ibverbs FFI handles.
#[macro_use]
pub(crate) mod boilerplate;

/// Provide interoperability with C return values.
pub(crate) mod interop;

/// Provide a `select` method for [`bool`], integer primitives, [`Option`], and [`Result`].
pub(crate) mod select;
