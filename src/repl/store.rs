// Flash-backed script store. Three logical slots (Default built-in,
// User raw source up to 16 KiB with an optional name, Clear) persisted as
// a sector-aligned image on a host file standing in for the flash part.
// Writes raise the global flash-operation flag so the audio domain
// quiesces for the duration; the flag is cleared by a drop guard even on
// the error path.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::fabric::state::SharedState;

pub const MAX_SCRIPT_BYTES: usize = 16 * 1024;
pub const FLASH_SECTOR: usize = 4096;

const MAGIC: &[u8; 4] = b"CVF1";
const TAG_DEFAULT: u8 = 0;
const TAG_USER: u8 = 1;
const TAG_CLEAR: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Default,
    User {
        name: Option<String>,
        source: String,
    },
    Clear,
}

pub struct ScriptStore {
    path: Option<PathBuf>,
    slot: Slot,
    state: Arc<SharedState>,
}

/// Clears the flash-operation flag when the write scope ends, error or
/// not.
struct FlashGuard<'a>(&'a SharedState);

impl Drop for FlashGuard<'_> {
    fn drop(&mut self) {
        self.0.flash_operation_pending.store(false, Ordering::Release);
    }
}

impl ScriptStore {
    /// Open the store. A missing or unreadable image falls back to the
    /// Default slot; `path = None` keeps everything in memory.
    pub fn open(path: Option<PathBuf>, state: Arc<SharedState>) -> Self {
        let slot = match &path {
            Some(p) if p.exists() => match std::fs::read(p) {
                Ok(image) => parse_image(&image).unwrap_or_else(|e| {
                    log::warn!("flash image unreadable ({e}), using default");
                    Slot::Default
                }),
                Err(e) => {
                    log::warn!("cannot read flash image: {e}");
                    Slot::Default
                }
            },
            _ => Slot::Default,
        };
        Self { path, slot, state }
    }

    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    pub fn script_name(&self) -> Option<&str> {
        match &self.slot {
            Slot::User { name, .. } => name.as_deref(),
            _ => None,
        }
    }

    /// Extract a script name from a leading `-- <name>.lua` comment.
    pub fn extract_name(source: &str) -> Option<String> {
        let first = source.lines().next()?;
        let rest = first.strip_prefix("--")?.trim();
        if rest.ends_with(".lua") && !rest.contains(char::is_whitespace) {
            Some(rest.to_string())
        } else {
            None
        }
    }

    /// Commit a user script. The audio domain is paused for the write.
    pub fn save_user(&mut self, source: &str) -> Result<(), String> {
        if source.len() > MAX_SCRIPT_BYTES {
            return Err(format!(
                "script too large: {} > {} bytes",
                source.len(),
                MAX_SCRIPT_BYTES
            ));
        }
        let name = Self::extract_name(source);
        let slot = Slot::User {
            name,
            source: source.to_string(),
        };
        self.write_slot(&slot)?;
        self.slot = slot;
        Ok(())
    }

    /// Mark the user slot cleared.
    pub fn clear(&mut self) -> Result<(), String> {
        self.write_slot(&Slot::Clear)?;
        self.slot = Slot::Clear;
        Ok(())
    }

    fn write_slot(&self, slot: &Slot) -> Result<(), String> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        self.state
            .flash_operation_pending
            .store(true, Ordering::Release);
        let _guard = FlashGuard(&self.state);

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, build_image(slot)).map_err(|e| format!("flash write failed: {e}"))
    }
}

fn build_image(slot: &Slot) -> Vec<u8> {
    let mut image = Vec::with_capacity(FLASH_SECTOR);
    image.extend_from_slice(MAGIC);
    match slot {
        Slot::Default => image.push(TAG_DEFAULT),
        Slot::Clear => image.push(TAG_CLEAR),
        Slot::User { name, source } => {
            image.push(TAG_USER);
            let name = name.as_deref().unwrap_or("");
            image.push(name.len().min(255) as u8);
            image.extend_from_slice(&name.as_bytes()[..name.len().min(255)]);
            image.extend_from_slice(&(source.len() as u32).to_le_bytes());
            image.extend_from_slice(source.as_bytes());
        }
    }
    // Pad to the sector boundary.
    let padded = image.len().div_ceil(FLASH_SECTOR) * FLASH_SECTOR;
    image.resize(padded, 0xFF);
    image
}

fn parse_image(image: &[u8]) -> Result<Slot, String> {
    if image.len() < 5 || &image[..4] != MAGIC {
        return Err("bad magic".into());
    }
    match image[4] {
        TAG_DEFAULT => Ok(Slot::Default),
        TAG_CLEAR => Ok(Slot::Clear),
        TAG_USER => {
            let name_len = *image.get(5).ok_or("truncated header")? as usize;
            let name_end = 6 + name_len;
            let name_bytes = image.get(6..name_end).ok_or("truncated name")?;
            let len_bytes = image.get(name_end..name_end + 4).ok_or("truncated length")?;
            let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
            if len > MAX_SCRIPT_BYTES {
                return Err("script length out of range".into());
            }
            let body = image
                .get(name_end + 4..name_end + 4 + len)
                .ok_or("truncated body")?;
            let name = if name_len == 0 {
                None
            } else {
                Some(String::from_utf8_lossy(name_bytes).into_owned())
            };
            Ok(Slot::User {
                name,
                source: String::from_utf8_lossy(body).into_owned(),
            })
        }
        t => Err(format!("unknown slot tag {t}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("corvid-test-{}-{name}.bin", std::process::id()));
        p
    }

    #[test]
    fn user_slot_round_trips_through_the_image() {
        let path = temp_path("roundtrip");
        let state = Arc::new(SharedState::new());
        let mut store = ScriptStore::open(Some(path.clone()), state.clone());
        store
            .save_user("-- blink.lua\noutput[1].volts = 1\n")
            .unwrap();

        let reopened = ScriptStore::open(Some(path.clone()), state);
        match reopened.slot() {
            Slot::User { name, source } => {
                assert_eq!(name.as_deref(), Some("blink.lua"));
                assert!(source.contains("output[1]"));
            }
            other => panic!("expected user slot, got {other:?}"),
        }
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn image_is_sector_aligned() {
        let image = build_image(&Slot::User {
            name: Some("a.lua".into()),
            source: "x".repeat(5000),
        });
        assert_eq!(image.len() % FLASH_SECTOR, 0);
        assert!(image.len() >= 5000);
    }

    #[test]
    fn clear_then_reopen_reports_clear() {
        let path = temp_path("clear");
        let state = Arc::new(SharedState::new());
        let mut store = ScriptStore::open(Some(path.clone()), state.clone());
        store.save_user("print('x')").unwrap();
        store.clear().unwrap();
        assert_eq!(ScriptStore::open(Some(path.clone()), state).slot(), &Slot::Clear);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn flash_flag_is_cleared_after_write() {
        let path = temp_path("flag");
        let state = Arc::new(SharedState::new());
        let mut store = ScriptStore::open(Some(path.clone()), state.clone());
        store.save_user("print('y')").unwrap();
        assert!(!state.flash_operation_pending.load(Ordering::Relaxed));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn name_extraction_requires_lua_comment() {
        assert_eq!(
            ScriptStore::extract_name("-- seq.lua\nrest"),
            Some("seq.lua".to_string())
        );
        assert_eq!(ScriptStore::extract_name("--seq.lua\n"), Some("seq.lua".into()));
        assert_eq!(ScriptStore::extract_name("x = 1"), None);
        assert_eq!(ScriptStore::extract_name("-- not a name"), None);
    }

    #[test]
    fn oversized_script_is_rejected() {
        let state = Arc::new(SharedState::new());
        let mut store = ScriptStore::open(None, state);
        let big = "y".repeat(MAX_SCRIPT_BYTES + 1);
        assert!(store.save_user(&big).is_err());
    }
}
