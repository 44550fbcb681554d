use chrono::Utc;
use std::sync::Mutex;
use uuid::{Builder, Uuid, Variant, Version};

static LAST_TIMESTAMP: Mutex<i64> = Mutex::new(0);

/// Microsecond timestamp that never repeats within the process: when the
/// clock does not advance the previous value plus one is used.
pub fn monotonic_micros() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = match LAST_TIMESTAMP.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let ts = if now <= *last { *last + 1 } else { now };
    *last = ts;
    ts
}

/// Time-ordered 128-bit id. The first 60 bits carry the microsecond
/// timestamp (version nibble 7 sits between them), so the canonical
/// hyphenated form sorts lexicographically in creation order.
pub fn timestamp_uuid() -> Uuid {
    uuid_for_micros(monotonic_micros())
}

pub fn uuid_for_micros(micros: i64) -> Uuid {
    let ts = (micros.max(0) as u64) & 0x0FFF_FFFF_FFFF_FFFF;
    let mut bytes = *Uuid::new_v4().as_bytes();
    bytes[..6].copy_from_slice(&(ts >> 12).to_be_bytes()[2..]);
    bytes[6] = ((ts >> 8) & 0x0F) as u8;
    bytes[7] = (ts & 0xFF) as u8;
    Builder::from_bytes(bytes)
        .with_version(Version::SortRand)
        .with_variant(Variant::RFC4122)
        .into_uuid()
}

pub fn make_run_id() -> String {
    timestamp_uuid().hyphenated().to_string()
}

pub fn is_run_id(s: &str) -> bool {
    s.len() == 36 && Uuid::parse_str(s).is_ok()
}

const CONSONANTS: &[u8; 16] = b"bdfghjklmnprstvz";
const VOWELS: &[u8; 4] = b"aiou";

fn quint(word: u16) -> String {
    let w = word as usize;
    let chars = [
        CONSONANTS[(w >> 12) & 0x0F],
        VOWELS[(w >> 10) & 0x03],
        CONSONANTS[(w >> 6) & 0x0F],
        VOWELS[(w >> 4) & 0x03],
        CONSONANTS[w & 0x0F],
    ];
    chars.iter().map(|c| *c as char).collect()
}

/// Pronounceable name for the low 32 bits of `id`: two five-letter
/// proquint words joined by a dash.
pub fn run_name_for_id(id: &str) -> String {
    let low = match Uuid::parse_str(id) {
        Ok(u) => {
            let b = u.as_bytes();
            u32::from_be_bytes([b[12], b[13], b[14], b[15]])
        }
        Err(_) => {
            let digest = crate::util::sha256_bytes(id.as_bytes());
            u32::from_str_radix(&digest[..8], 16).unwrap_or(0)
        }
    };
    format!("{}-{}", quint((low >> 16) as u16), quint(low as u16))
}
