/// Generates an enum over a protocol-defined value space that reserves
/// part of the range for vendor extensions.
///
/// BACnet reason codes and similar enumerations name the standard values
/// but still admit proprietary values inside a vendor range and reserved
/// values outside it. The generated enum carries named variants plus
/// `Custom` (inside `$range`) and `Reserved` (outside it), so decoding an
/// unexpected byte never fails.
///
/// # Arguments
///
/// * `$name:ident` - The name of the enum to be generated.
/// * `$variant:ident = $value:expr` - Named variants with their wire values.
/// * `$unit:ident` - The underlying integer type (`u8`, `u16`, `u32`).
/// * `$range:expr` - The vendor-proprietary range (e.g. `64..=255`).
///
/// # Example
///
/// ```rust
/// use bacnet_core::generate_custom_enum;
///
/// generate_custom_enum! {
///     DemoReason {
///         Other = 0,
///         Overflow = 1,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(DemoReason::from(1u8), DemoReason::Overflow);
/// assert_eq!(u8::from(DemoReason::Overflow), 1);
/// if let DemoReason::Custom(value) = DemoReason::from(100u8) {
///     assert_eq!(value.value(), 100);
/// } else {
///     panic!("expected DemoReason::Custom");
/// }
/// if let DemoReason::Reserved(value) = DemoReason::from(40u8) {
///     assert_eq!(value.value(), 40);
/// } else {
///     panic!("expected DemoReason::Reserved");
/// }
/// assert_eq!(format!("{}", DemoReason::Other), "Other");
/// ```
#[macro_export]
macro_rules! generate_custom_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $unit:ident, $custom_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                Custom( [<$name Value>] ),
                Reserved( [<$name Value>] ),
            }

            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                fn new(value: $unit) -> Self {
                    Self { value }
                }

                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Custom( value ) => write!(f, "Custom({})", value.value()),
                        $name::Reserved( value ) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Custom( value ) => value.value(),
                        $name::Reserved( value ) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if !($custom_range).contains(&v) => {
                            $name::Reserved( [<$name Value>]::new(v) )
                        }
                        v if ($custom_range).contains(&v) => {
                            $name::Custom( [<$name Value>]::new(v) )
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    };
}
