use rand::seq::SliceRandom;
use rand::thread_rng;

/// URL-safe alphabet, 64 symbols.
const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

pub const ID_LEN: usize = 10;

/// Generate a fresh paste id.
pub fn generate_id() -> String {
    let mut rng = thread_rng();
    (0..ID_LEN)
        .filter_map(|_| ALPHABET.choose(&mut rng))
        .map(|&b| char::from(b))
        .collect()
}

/// Whether `id` could have been produced by [`generate_id`].
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..100 {
            let id = generate_id();
            assert_eq!(id.len(), ID_LEN);
            assert!(is_valid_id(&id), "{id}");
        }
    }

    #[test]
    fn generated_ids_do_not_collide() {
        let ids: HashSet<_> = (0..10_000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn rejects_foreign_ids() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("short"));
        assert!(!is_valid_id("abcdefghijk"));
        assert!(!is_valid_id("../../etc/"));
        assert!(!is_valid_id("abc:defghi"));
        assert!(is_valid_id("abc_DEF-09"));
    }
}
