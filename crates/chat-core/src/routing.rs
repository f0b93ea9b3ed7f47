use serde::{Deserialize, Serialize};

/// Self-reported load of one relay process.
///
/// Used both as the body of register/update calls and as the answer to a
/// selection query. `load` is unsigned, so a negative value fails to decode;
/// an omitted `load` decodes as 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub address: String,
    #[serde(default)]
    pub load: u32,
}

impl LoadReport {
    pub fn new(address: impl Into<String>, load: u32) -> Self {
        Self {
            address: address.into(),
            load,
        }
    }

    /// Initial registration body: a process announces itself with no sessions.
    pub fn registration(address: impl Into<String>) -> Self {
        Self::new(address, 0)
    }
}
