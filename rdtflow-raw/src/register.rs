//! Generic register abstraction for type-safe MSR programming

/// Trait for register layouts that can be converted to/from raw MSR values
///
/// # Example
///
/// ```ignore
/// use rdtflow_raw::register::RegisterLayout;
///
/// #[derive(Debug, Default)]
/// struct QosConfig {
///     cdp_enable: bool,
/// }
///
/// impl RegisterLayout for QosConfig {
///     fn to_msr_value(&self) -> u64 {
///         self.cdp_enable as u64
///     }
///
///     fn from_msr_value(value: u64) -> Self {
///         Self {
///             cdp_enable: (value & 1) != 0,
///         }
///     }
/// }
/// ```
pub trait RegisterLayout: Sized {
    /// Convert this register layout to a raw MSR value
    fn to_msr_value(&self) -> u64;

    /// Parse a raw MSR value into this register layout
    fn from_msr_value(value: u64) -> Self;

    /// Validate that the register values are within acceptable ranges
    ///
    /// Returns `Ok(())` if valid, or an error message if invalid.
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}
