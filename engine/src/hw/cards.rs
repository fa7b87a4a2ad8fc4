use std::fs;
use std::path::Path;

pub const PROC_ASOUND: &str = "/proc/asound";
const MAX_CARDS: u32 = 32;

pub fn card_id(proc_root: &Path, card: u32) -> Option<String> {
    let raw = fs::read_to_string(proc_root.join(format!("card{card}")).join("id")).ok()?;
    let id = raw.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

pub fn find_card_by_name(proc_root: &Path, name: &str) -> Option<u32> {
    (0..MAX_CARDS).find(|&card| card_id(proc_root, card).as_deref() == Some(name))
}
