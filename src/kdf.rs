// PKCS#5 header-key derivation.
//
// The header key is always derived at the largest size any supported
// cascade needs (192 bytes); callers slice off what their cipher uses.
// Iteration counts follow the volume defaults of each PRF, or the
// `15000 + pim * 1000` personal-iteration formula when a PIM is given.

use blake2::Blake2s256;
use hmac::{Hmac, SimpleHmac};
use ripemd::Ripemd160;
use sha2::{Sha256, Sha512};
use streebog::Streebog512;
use whirlpool::Whirlpool;

use crate::format::FormatError;
use crate::layout::SALT_SIZE;

pub const HEADER_KEY_SIZE: usize = 192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kdf {
    Sha512,
    Sha256,
    Whirlpool,
    Blake2s,
    Streebog,
    Ripemd160,
}

impl Kdf {
    pub fn name(self) -> &'static str {
        match self {
            Kdf::Sha512 => "HMAC-SHA-512",
            Kdf::Sha256 => "HMAC-SHA-256",
            Kdf::Whirlpool => "HMAC-Whirlpool",
            Kdf::Blake2s => "HMAC-BLAKE2s-256",
            Kdf::Streebog => "HMAC-Streebog",
            Kdf::Ripemd160 => "HMAC-RIPEMD-160",
        }
    }

    pub fn iterations(self, pim: u32) -> Result<u32, FormatError> {
        if pim == 0 {
            return Ok(match self {
                Kdf::Ripemd160 => 655_331,
                _ => 500_000,
            });
        }

        let count = 15_000u64 + pim as u64 * 1_000;
        u32::try_from(count).map_err(|_| FormatError::ParameterIncorrect)
    }
}

pub fn derive_header_key(
    kdf: Kdf,
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    pim: u32,
    out: &mut [u8],
) -> Result<(), FormatError> {
    let iterations = kdf.iterations(pim)?;

    let result = match kdf {
        Kdf::Sha512 => pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt, iterations, out),
        Kdf::Sha256 => pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, out),
        Kdf::Whirlpool => pbkdf2::pbkdf2::<Hmac<Whirlpool>>(password, salt, iterations, out),
        Kdf::Blake2s => pbkdf2::pbkdf2::<SimpleHmac<Blake2s256>>(password, salt, iterations, out),
        Kdf::Streebog => pbkdf2::pbkdf2::<SimpleHmac<Streebog512>>(password, salt, iterations, out),
        Kdf::Ripemd160 => pbkdf2::pbkdf2::<Hmac<Ripemd160>>(password, salt, iterations, out),
    };

    result.map_err(|_| FormatError::ParameterIncorrect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_iteration_counts() {
        assert_eq!(Kdf::Sha512.iterations(0).unwrap(), 500_000);
        assert_eq!(Kdf::Blake2s.iterations(0).unwrap(), 500_000);
        assert_eq!(Kdf::Ripemd160.iterations(0).unwrap(), 655_331);
    }

    #[test]
    fn pim_overrides_the_default() {
        assert_eq!(Kdf::Sha512.iterations(485).unwrap(), 500_000);
        assert_eq!(Kdf::Ripemd160.iterations(1).unwrap(), 16_000);
        assert!(Kdf::Sha256.iterations(u32::MAX).is_err());
    }

    #[test]
    fn derivation_depends_on_salt_and_pim() {
        let mut salt = [0u8; SALT_SIZE];
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];

        derive_header_key(Kdf::Sha512, b"pw", &salt, 1, &mut a).unwrap();
        salt[0] = 1;
        derive_header_key(Kdf::Sha512, b"pw", &salt, 1, &mut b).unwrap();
        assert_ne!(a, b);

        let mut c = [0u8; 64];
        derive_header_key(Kdf::Sha512, b"pw", &salt, 2, &mut c).unwrap();
        assert_ne!(b, c);
    }
}
