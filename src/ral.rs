//! Register access helpers
//!
//! Re-exports the `ral-registers` macros, and adds a shorthand for
//! declaring the field modules that the macros expect. Both the
//! controller register blocks and the hardware-shared descriptors
//! use this interface.

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Declare RAL field modules for a register
///
/// ```ignore
/// pub mod TOKEN {
///     fields! {
///         STATUS @ 0 : 8,
///         IOC @ 15 : 1,
///     }
/// }
/// ```
macro_rules! fields {
    ($($field:ident @ $offset:literal : $width:literal),* $(,)?) => {
        $(
            pub mod $field {
                pub const offset: u32 = $offset;
                pub const mask: u32 = ((((1u64 << $width) - 1) as u32) << offset);
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        )*
    };
}
