use std::fmt;

/// Power state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    /// No signal has been received yet
    #[default]
    Initial,
    /// The platform has no usable radio
    Unsupported,
    On,
    Off,
    /// The radio exists but is disabled by the user or policy
    Disabled,
}

impl AdapterState {
    /// The string reported in `radioState` events
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::On => "poweredOn",
            Self::Off | Self::Disabled => "poweredOff",
            Self::Initial => "unknown",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about a Bluetooth adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter index
    pub index: usize,
    /// Adapter name or identifier
    pub name: String,
    /// Whether this is the default adapter
    pub is_default: bool,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}: {}{}",
            self.index,
            self.name,
            if self.is_default { " (default)" } else { "" }
        )
    }
}
