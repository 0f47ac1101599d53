use serde::{Deserialize, Serialize};

/// What a label line points at. Only `addr` and `tx` lines attribute
/// anything; the other BIP-329 kinds are accepted and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelTarget {
    Addr,
    Tx,
    Input,
    Output,
    Pubkey,
    Xpub,
}

/// A BIP-329 line as exported by wallets and label services.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LabelRecord {
    #[serde(rename = "type")]
    pub target: LabelTarget,
    #[serde(rename = "ref")]
    pub reference: String,
    pub label: String,
    /// Key origin of the wallet that wrote the label, when exported.
    #[serde(default)]
    pub origin: Option<String>,
}

/// Category of a labelled entity. Label files live under a folder that
/// names it: `exchanges/kraken.jsonl` is an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Exchange,
    Service,
    Mixer,
    Other,
}

impl EntityKind {
    /// Singular or plural, any case.
    pub fn from_folder(folder: &str) -> Self {
        let folder = folder.to_ascii_lowercase();
        match folder.strip_suffix('s').unwrap_or(&folder) {
            "exchange" => Self::Exchange,
            "service" => Self::Service,
            "mixer" => Self::Mixer,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub kind: EntityKind,
    /// Label file the attribution came from, e.g. `exchanges/kraken`.
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_map_to_kinds() {
        assert_eq!(EntityKind::from_folder("Exchanges"), EntityKind::Exchange);
        assert_eq!(EntityKind::from_folder("mixer"), EntityKind::Mixer);
        assert_eq!(EntityKind::from_folder("services"), EntityKind::Service);
        assert_eq!(EntityKind::from_folder("pools"), EntityKind::Other);
    }
}
