//! Declarative helpers for protocol enums.

/// Defines a `u32`-backed message type enum with lossless conversions.
macro_rules! define_message_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Message type code carried in the authenticated header of every packet.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum MessageType {
            $($name = $val),*
        }

        impl MessageType {
            pub fn code(self) -> u32 {
                self as u32
            }
        }

        impl TryFrom<u32> for MessageType {
            type Error = $crate::error::TuyaError;

            fn try_from(value: u32) -> $crate::error::Result<Self> {
                match value {
                    $($val => Ok(MessageType::$name),)*
                    _ => Err($crate::error::TuyaError::DecodeError(format!(
                        "Unknown message type: 0x{:02x}",
                        value
                    ))),
                }
            }
        }
    };
}
