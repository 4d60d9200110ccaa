// Small macros shared across the crate.

/// Generates fluent builder setters: each method takes anything that
/// converts into the field type and returns `self` for chaining.
macro_rules! builder_setters {
    ($($(#[$meta:meta])* $field:ident: $type:ty),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $field(mut self, value: impl Into<$type>) -> Self {
                self.$field = value.into();
                self
            }
        )*
    };
}

pub(crate) use builder_setters;
