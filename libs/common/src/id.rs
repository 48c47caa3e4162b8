use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = lattice_common::id::prefixed_ulid("usr");
/// assert!(id.starts_with("usr_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string())
}

/// Returns true if `id` looks like a `prefix_ULID` identifier: a short
/// lowercase-ASCII prefix, an underscore, and a 26-character Crockford
/// base32 ULID. Used to validate client-supplied connection IDs before
/// they reach the hub.
pub fn is_valid_id(id: &str) -> bool {
    let Some((prefix, ulid)) = id.rsplit_once('_') else {
        return false;
    };
    if prefix.is_empty() || prefix.len() > 8 {
        return false;
    }
    if !prefix.bytes().all(|b| b.is_ascii_lowercase()) {
        return false;
    }
    ulid.len() == 26 && Ulid::from_string(ulid).is_ok()
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const USER: &str = "usr";
    pub const SESSION: &str = "ses";
    pub const CONNECTION: &str = "conn";
    pub const CHANNEL: &str = "ch";
    pub const TEAM: &str = "team";
}
