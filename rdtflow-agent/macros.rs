//! Declarative macros to reduce boilerplate across the rdtflow codebase

/// Define a metric enum with automatic `name()` and `all()` implementations
///
/// # Example
/// ```
/// use rdtflow::metric_enum;
///
/// metric_enum! {
///     pub enum CacheEvent {
///         Occupancy => "LLCOccupancy",
///         Misses => "LLCMisses",
///     }
/// }
///
/// let event = CacheEvent::Misses;
/// assert_eq!(event.name(), "LLCMisses");
/// assert_eq!(CacheEvent::all().len(), 2);
/// ```
///
/// Expands to:
/// - An enum with Debug, Clone, Copy, PartialEq, Eq, Hash derives
/// - A `name(&self) -> &'static str` method
/// - An `all() -> Vec<Self>` method in declaration order
#[macro_export]
macro_rules! metric_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $str:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }
    };
}

/// Encode a registry's metric families into a text buffer
///
/// # Example
/// ```ignore
/// // In main.rs metrics handler
/// let mut buffer = Vec::new();
/// gather_metrics!(buffer, encoder, state.exporter, "session");
/// ```
#[macro_export]
macro_rules! gather_metrics {
    ($buffer:expr, $encoder:expr, $exporter:expr, $name:literal) => {
        let metric_families = $exporter.registry().gather();
        if let Err(e) = $encoder.encode(&metric_families, &mut $buffer) {
            tracing::error!(concat!("Failed to encode ", $name, " metrics: {}"), e);
        }
    };
}

/// Define an enum with name() and all() methods, plus custom data per variant
///
/// # Example
/// ```
/// use rdtflow::enum_with_data;
///
/// enum_with_data! {
///     pub enum Direction: u32 {
///         Read => ("Read", 0x21E),
///         Write => ("Write", 0x200),
///     }
///     impl opcode -> u32
/// }
///
/// let dir = Direction::Read;
/// assert_eq!(dir.name(), "Read");
/// assert_eq!(dir.opcode(), 0x21E);
/// ```
#[macro_export]
macro_rules! enum_with_data {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident: $data_type:ty {
            $($variant:ident => ($str:literal, $data:expr)),* $(,)?
        }
        impl $method:ident -> $return_type:ty
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $str,)*
                }
            }

            pub fn $method(&self) -> $return_type {
                match self {
                    $($name::$variant => $data,)*
                }
            }

            pub fn all() -> Vec<$name> {
                vec![$($name::$variant,)*]
            }
        }
    };
}
