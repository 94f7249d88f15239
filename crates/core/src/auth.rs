//! Player password hashing. The legacy database stores classic DES
//! crypt(3) hashes in `A_PASS`, so verification has to speak that
//! format; new passwords keep using it for flatfile compatibility.

use rand::Rng;

const SALT_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789./";

/// Hashes `password` with the given 2-character DES salt. The result is
/// the familiar 13-character crypt string beginning with the salt.
pub fn crypt(password: &str, salt: &str) -> String {
    pwhash::unix_crypt::hash_with(salt, password).unwrap_or_default()
}

/// Hashes `password` under a random salt.
pub fn hash_password(password: &str) -> String {
    let mut rng = rand::thread_rng();
    let salt: String = (0..2)
        .map(|_| SALT_CHARS[rng.gen_range(0..SALT_CHARS.len())] as char)
        .collect();
    crypt(password, &salt)
}

/// Verifies `password` against a stored crypt hash.
pub fn check_password(password: &str, hash: &str) -> bool {
    if hash.is_empty() {
        return false;
    }
    pwhash::unix_crypt::verify(password, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypt_matches_reference_shape() {
        let hash = crypt("testpass", "XX");
        assert_eq!(hash.len(), 13);
        assert!(hash.starts_with("XX"));
    }

    #[test]
    fn check_accepts_correct_password() {
        let hash = crypt("testpass", "XX");
        assert!(check_password("testpass", &hash));
        assert!(!check_password("wrong", &hash));
    }

    #[test]
    fn random_salt_hashes_verify() {
        let hash = hash_password("s3cret");
        assert_eq!(hash.len(), 13);
        assert!(check_password("s3cret", &hash));
    }

    #[test]
    fn empty_hash_never_verifies() {
        assert!(!check_password("anything", ""));
    }
}
