//! Declarative helpers for protocol constant tables.

/// Generates the `CommandType` enum plus raw-u32 conversions from a
/// `Name = code` table.
macro_rules! define_command_type {
    ( $( $(#[$attr:meta])* $name:ident = $code:expr ),+ $(,)? ) => {
        /// Tuya LAN command codes.
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CommandType {
            $( $(#[$attr])* $name = $code, )+
        }

        impl CommandType {
            /// Maps a raw command code back to a known command, if any.
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $( v if v == Self::$name as u32 => Some(Self::$name), )+
                    _ => None,
                }
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Generates the `Version` enum from a `Name = "string"` table, with string
/// conversions in both directions.
macro_rules! define_version {
    ( $( $name:ident = $tag:literal ),+ $(,)? ) => {
        /// Supported Tuya protocol versions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $( $name, )+
        }

        impl Version {
            /// The on-wire version tag, e.g. `"3.3"`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$name => $tag, )+
                }
            }

            /// The on-wire version tag as raw bytes.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $( $tag => Ok(Self::$name), )+
                    _ => Err($crate::error::TuyaError::UnsupportedVersion(s.to_string())),
                }
            }
        }
    };
}
