use rand::rngs::OsRng;
use rand::RngCore;

/// Default identifier length
pub const DEFAULT_ID_LENGTH: usize = 63;

/// Length of the prefix that must not read as a decimal number
const NUMERIC_PREFIX_LENGTH: usize = 12;

/// Generate a lowercase hex identifier of `length` characters from the OS
/// random source.
///
/// Candidates whose first 12 characters parse as a decimal integer are
/// discarded, so no identifier can be mistaken for a numeric name.
pub fn generate_id(length: usize) -> String {
    let mut bytes = vec![0u8; (length + 1) / 2];
    loop {
        OsRng.fill_bytes(&mut bytes);
        let mut id = hex::encode(&bytes);
        id.truncate(length);
        if !looks_numeric(&id) {
            return id;
        }
    }
}

fn looks_numeric(id: &str) -> bool {
    let prefix = &id[..id.len().min(NUMERIC_PREFIX_LENGTH)];
    prefix.parse::<u64>().is_ok()
}
