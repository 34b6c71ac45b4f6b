//! SHA-512 crypt (`$6$`) password hashing, compatible with `/etc/shadow`.

use rand::Rng;
use sha2::{Digest, Sha512};
use thiserror::Error;

pub const SCHEME_SHA512_CRYPT: &str = "sha512-crypt";
pub const DEFAULT_ROUNDS: u32 = 5000;
const MAX_SALT_LEN: usize = 16;
const CRYPT_ALPHABET: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Byte order of the final digest in the encoded output, three bytes per group.
const TRANSPOSE: [(usize, usize, usize); 21] = [
    (0, 21, 42),
    (22, 43, 1),
    (44, 2, 23),
    (3, 24, 45),
    (25, 46, 4),
    (47, 5, 26),
    (6, 27, 48),
    (28, 49, 7),
    (50, 8, 29),
    (9, 30, 51),
    (31, 52, 10),
    (53, 11, 32),
    (12, 33, 54),
    (34, 55, 13),
    (56, 14, 35),
    (15, 36, 57),
    (37, 58, 16),
    (59, 17, 38),
    (18, 39, 60),
    (40, 61, 19),
    (62, 20, 41),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PasswordError {
    #[error("salt must not exceed {MAX_SALT_LEN} bytes")]
    SaltTooLong,

    #[error("salt contains characters outside the crypt alphabet")]
    InvalidSalt,
}

/// Random salt drawn from the crypt alphabet.
#[must_use]
pub fn random_salt(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len.min(MAX_SALT_LEN))
        .map(|_| CRYPT_ALPHABET[rng.gen_range(0..CRYPT_ALPHABET.len())] as char)
        .collect()
}

fn repeat_to(len: usize, block: &[u8]) -> Vec<u8> {
    block.iter().copied().cycle().take(len).collect()
}

fn encode(digest: &[u8]) -> String {
    fn push(out: &mut String, mut w: u32, n: usize) {
        for _ in 0..n {
            out.push(CRYPT_ALPHABET[(w & 0x3f) as usize] as char);
            w >>= 6;
        }
    }
    let mut out = String::with_capacity(86);
    for (a, b, c) in TRANSPOSE {
        let w = (u32::from(digest[a]) << 16) | (u32::from(digest[b]) << 8) | u32::from(digest[c]);
        push(&mut out, w, 4);
    }
    push(&mut out, u32::from(digest[63]), 2);
    out
}

/// The encoded hash part of a `$6$salt$hash` string for `rounds` rounds.
pub fn sha512_crypt(password: &str, salt: &str, rounds: u32) -> Result<String, PasswordError> {
    let pw = password.as_bytes();
    let salt = salt.as_bytes();
    if salt.len() > MAX_SALT_LEN {
        return Err(PasswordError::SaltTooLong);
    }
    if !salt.iter().all(|b| CRYPT_ALPHABET.contains(b)) {
        return Err(PasswordError::InvalidSalt);
    }

    let alternate = Sha512::new()
        .chain_update(pw)
        .chain_update(salt)
        .chain_update(pw)
        .finalize();

    let mut ctx = Sha512::new().chain_update(pw).chain_update(salt);
    ctx.update(repeat_to(pw.len(), &alternate));
    let mut n = pw.len();
    while n > 0 {
        if n & 1 == 1 {
            ctx.update(alternate);
        } else {
            ctx.update(pw);
        }
        n >>= 1;
    }
    let intermediate = ctx.finalize();

    let mut dp = Sha512::new();
    for _ in 0..pw.len() {
        dp.update(pw);
    }
    let p_bytes = repeat_to(pw.len(), &dp.finalize());

    let mut ds = Sha512::new();
    for _ in 0..16 + usize::from(intermediate[0]) {
        ds.update(salt);
    }
    let s_bytes = repeat_to(salt.len(), &ds.finalize());

    let mut current = intermediate.to_vec();
    for i in 0..rounds {
        let mut c = Sha512::new();
        if i & 1 == 1 {
            c.update(&p_bytes);
        } else {
            c.update(&current);
        }
        if i % 3 != 0 {
            c.update(&s_bytes);
        }
        if i % 7 != 0 {
            c.update(&p_bytes);
        }
        if i & 1 == 1 {
            c.update(&current);
        } else {
            c.update(&p_bytes);
        }
        current = c.finalize().to_vec();
    }

    Ok(encode(&current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector() {
        let hash = sha512_crypt("Hello world!", "saltstring", DEFAULT_ROUNDS).unwrap();
        assert_eq!(
            hash,
            "svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJuesI68u4OTLiBFdcbYEdFCoEOfaS35inz1"
        );
    }

    #[test]
    fn test_salt_validation() {
        assert_eq!(
            sha512_crypt("pw", "0123456789abcdefg", DEFAULT_ROUNDS),
            Err(PasswordError::SaltTooLong)
        );
        assert_eq!(
            sha512_crypt("pw", "bad$salt", DEFAULT_ROUNDS),
            Err(PasswordError::InvalidSalt)
        );
    }

    #[test]
    fn test_random_salt_is_crypt_safe() {
        let salt = random_salt(16);
        assert_eq!(salt.len(), 16);
        assert!(sha512_crypt("pw", &salt, DEFAULT_ROUNDS).is_ok());
        assert_eq!(random_salt(40).len(), 16);
    }
}
