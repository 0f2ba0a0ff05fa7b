//! A small persisted identifier distinguishing this workstation install from
//! others using the same cluster (spec §6 `ArriveAsClient(user-at-host,
//! install-id, version)`). Generated once and cached next to the config file.

use std::path::PathBuf;

use rand::Rng;

fn path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".config").join(drift_config::PRODUCT).join("install_id"))
}

pub fn load_or_create() -> String {
    let Some(path) = path() else {
        return random_id();
    };

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }

    let id = random_id();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(&path, &id);
    id
}

fn random_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
