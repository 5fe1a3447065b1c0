// Volume header codec.
//
// On disk a header slot is 512 bytes: a 64-byte salt followed by 448
// bytes encrypted as a single XTS unit with tweak 0 under a key derived
// from the password. Field offsets below are relative to the decrypted
// 448-byte region; all fields are big-endian. Creation timestamps are
// written as zero.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{xts_key_vulnerable, CipherKind, CryptoContext, VolumeCipher};
use crate::format::FormatError;
use crate::kdf::{derive_header_key, Kdf, HEADER_KEY_SIZE};
use crate::layout::{HEADER_EFFECTIVE_SIZE, MASTER_KEYDATA_SIZE, SALT_SIZE};
use crate::rng::EntropySource;

const MAGIC: &[u8; 4] = b"VERA";
const HEADER_VERSION: u16 = 5;
const MIN_PROGRAM_VERSION: u16 = 0x010b;

const PAYLOAD_SIZE: usize = HEADER_EFFECTIVE_SIZE - SALT_SIZE;
const CRC_OFFSET: usize = 188;
const KEY_AREA_OFFSET: usize = 192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    InvalidMagic,
    InvalidCrc,
    UnsupportedVersion,
    UnsupportedProgramVersion,
    InvalidSectorSize,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderError::InvalidMagic => write!(f, "header magic not found"),
            HeaderError::InvalidCrc => write!(f, "header CRC mismatch"),
            HeaderError::UnsupportedVersion => write!(f, "unsupported header version"),
            HeaderError::UnsupportedProgramVersion => write!(f, "unsupported required program version"),
            HeaderError::InvalidSectorSize => write!(f, "invalid sector size"),
        }
    }
}

// Inputs to a header build. `password: None` selects decoy mode: the
// header is encrypted under a random throwaway key, which makes the slot
// statistically identical to a real hidden header without being
// decryptable by anyone.
pub struct HeaderSpec<'a> {
    pub cipher: CipherKind,
    pub kdf: Kdf,
    pub pim: u32,
    pub password: Option<&'a [u8]>,
    pub data_area_size: u64,
    pub hidden_volume_size: u64,
    pub data_offset: u64,
    pub flags: u32,
    pub sector_size: u32,
}

// Build one ciphertext header. With `preset_keydata` the header reuses
// existing master keys (backup headers must decrypt to the same keys as
// the primary); otherwise fresh key material is drawn.
pub fn build_header(
    rng: &mut dyn EntropySource,
    spec: &HeaderSpec,
    preset_keydata: Option<&[u8; MASTER_KEYDATA_SIZE]>,
) -> Result<(Zeroizing<[u8; HEADER_EFFECTIVE_SIZE]>, CryptoContext), FormatError> {
    let ks = spec.cipher.key_size();

    let mut salt = [0u8; SALT_SIZE];
    rng.fill(&mut salt, true)?;

    let mut keydata = Zeroizing::new([0u8; MASTER_KEYDATA_SIZE]);
    match preset_keydata {
        Some(preset) => keydata.copy_from_slice(preset),
        None => loop {
            rng.fill(&mut keydata[..], true)?;
            if !xts_key_vulnerable(&keydata[..], ks) {
                break;
            }
        },
    }

    let ctx = CryptoContext::new(spec.cipher, &keydata)?;

    let mut payload = Zeroizing::new([0u8; PAYLOAD_SIZE]);
    payload[0..4].copy_from_slice(MAGIC);
    BigEndian::write_u16(&mut payload[4..6], HEADER_VERSION);
    BigEndian::write_u16(&mut payload[6..8], MIN_PROGRAM_VERSION);
    BigEndian::write_u32(&mut payload[8..12], crc32fast::hash(&keydata[..]));
    // 12..28: volume and header creation times, deliberately zero
    BigEndian::write_u64(&mut payload[28..36], spec.hidden_volume_size);
    BigEndian::write_u64(&mut payload[36..44], spec.data_area_size);
    BigEndian::write_u64(&mut payload[44..52], spec.data_offset);
    BigEndian::write_u64(&mut payload[52..60], spec.data_area_size);
    BigEndian::write_u32(&mut payload[60..64], spec.flags);
    BigEndian::write_u32(&mut payload[64..68], spec.sector_size);
    let crc = crc32fast::hash(&payload[..CRC_OFFSET]);
    BigEndian::write_u32(&mut payload[CRC_OFFSET..CRC_OFFSET + 4], crc);
    payload[KEY_AREA_OFFSET..].copy_from_slice(&keydata[..]);

    let mut header_key = Zeroizing::new([0u8; HEADER_KEY_SIZE]);
    match spec.password {
        Some(password) => derive_header_key(spec.kdf, password, &salt, spec.pim, &mut header_key[..])?,
        None => rng.fill(&mut header_key[..], true)?,
    }

    let header_cipher = VolumeCipher::new(spec.cipher, &header_key[..ks], &header_key[ks..2 * ks])?;
    header_cipher.encrypt_block(&mut payload[..], 0);

    let mut out = Zeroizing::new([0u8; HEADER_EFFECTIVE_SIZE]);
    out[..SALT_SIZE].copy_from_slice(&salt);
    out[SALT_SIZE..].copy_from_slice(&payload[..]);

    Ok((out, ctx))
}

#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    pub version: u16,
    pub min_program_version: u16,
    pub hidden_volume_size: u64,
    pub volume_data_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    #[zeroize(skip)]
    pub flags: u32,
    #[zeroize(skip)]
    pub sector_size: u32,
    pub master_keydata: [u8; MASTER_KEYDATA_SIZE],
}

impl VolumeHeader {
    // Deserialize a decrypted 448-byte header payload.
    pub fn deserialize(payload: &[u8]) -> Result<VolumeHeader, HeaderError> {
        if payload.len() < PAYLOAD_SIZE {
            return Err(HeaderError::InvalidMagic);
        }

        if &payload[0..4] != MAGIC {
            log::debug!("header magic mismatch: {}", hex::encode(&payload[0..4]));
            return Err(HeaderError::InvalidMagic);
        }

        let version = BigEndian::read_u16(&payload[4..6]);
        if version < 4 || version > HEADER_VERSION {
            return Err(HeaderError::UnsupportedVersion);
        }

        let min_program_version = BigEndian::read_u16(&payload[6..8]);
        if min_program_version > 0x011a {
            return Err(HeaderError::UnsupportedProgramVersion);
        }

        let stored_crc = BigEndian::read_u32(&payload[CRC_OFFSET..CRC_OFFSET + 4]);
        if stored_crc != crc32fast::hash(&payload[..CRC_OFFSET]) {
            return Err(HeaderError::InvalidCrc);
        }

        let key_area_crc = BigEndian::read_u32(&payload[8..12]);
        if key_area_crc != crc32fast::hash(&payload[KEY_AREA_OFFSET..KEY_AREA_OFFSET + MASTER_KEYDATA_SIZE]) {
            return Err(HeaderError::InvalidCrc);
        }

        let sector_size = if version < 5 {
            512
        } else {
            BigEndian::read_u32(&payload[64..68])
        };
        if sector_size < 512 || sector_size > 4096 || !sector_size.is_power_of_two() {
            return Err(HeaderError::InvalidSectorSize);
        }

        let mut master_keydata = [0u8; MASTER_KEYDATA_SIZE];
        master_keydata.copy_from_slice(&payload[KEY_AREA_OFFSET..KEY_AREA_OFFSET + MASTER_KEYDATA_SIZE]);

        Ok(VolumeHeader {
            version,
            min_program_version,
            hidden_volume_size: BigEndian::read_u64(&payload[28..36]),
            volume_data_size: BigEndian::read_u64(&payload[36..44]),
            encrypted_area_start: BigEndian::read_u64(&payload[44..52]),
            encrypted_area_length: BigEndian::read_u64(&payload[52..60]),
            flags: BigEndian::read_u32(&payload[60..64]),
            sector_size,
            master_keydata,
        })
    }
}

// Decrypt and parse a header slot with known parameters. Mounting proper
// is out of scope; this exists for backup-header verification and tests.
pub fn decrypt_header(
    raw: &[u8; HEADER_EFFECTIVE_SIZE],
    password: &[u8],
    kdf: Kdf,
    pim: u32,
    cipher: CipherKind,
) -> Result<VolumeHeader, FormatError> {
    let ks = cipher.key_size();

    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&raw[..SALT_SIZE]);

    let mut header_key = Zeroizing::new([0u8; HEADER_KEY_SIZE]);
    derive_header_key(kdf, password, &salt, pim, &mut header_key[..])?;

    let header_cipher = VolumeCipher::new(cipher, &header_key[..ks], &header_key[ks..2 * ks])?;

    let mut payload = Zeroizing::new([0u8; PAYLOAD_SIZE]);
    payload.copy_from_slice(&raw[SALT_SIZE..]);
    header_cipher.decrypt_block(&mut payload[..], 0);

    VolumeHeader::deserialize(&payload[..]).map_err(FormatError::Header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::EntropySource;

    // Cheap deterministic generator; header tests only need distinct bytes.
    pub struct XorShiftEntropy(pub u64);

    impl EntropySource for XorShiftEntropy {
        fn fill(&mut self, dst: &mut [u8], _strong: bool) -> Result<(), FormatError> {
            for b in dst {
                self.0 ^= self.0 << 13;
                self.0 ^= self.0 >> 7;
                self.0 ^= self.0 << 17;
                *b = self.0 as u8;
            }
            Ok(())
        }
    }

    fn spec(password: Option<&'static [u8]>) -> HeaderSpec<'static> {
        HeaderSpec {
            cipher: CipherKind::Aes,
            kdf: Kdf::Sha512,
            pim: 1,
            password,
            data_area_size: 8 * 1024 * 1024,
            hidden_volume_size: 0,
            data_offset: 131_072,
            flags: 0,
            sector_size: 512,
        }
    }

    #[test]
    fn built_header_decrypts_back_to_its_fields() {
        let mut rng = XorShiftEntropy(42);
        let spec = spec(Some(b"correct horse battery staple".as_slice()));
        let (raw, ctx) = build_header(&mut rng, &spec, None).unwrap();

        let parsed = decrypt_header(&raw, b"correct horse battery staple", spec.kdf, spec.pim, spec.cipher).unwrap();
        assert_eq!(parsed.version, HEADER_VERSION);
        assert_eq!(parsed.volume_data_size, spec.data_area_size);
        assert_eq!(parsed.encrypted_area_start, spec.data_offset);
        assert_eq!(parsed.encrypted_area_length, spec.data_area_size);
        assert_eq!(parsed.hidden_volume_size, 0);
        assert_eq!(parsed.sector_size, 512);
        assert_eq!(&parsed.master_keydata, ctx.master_keydata());
    }

    #[test]
    fn wrong_password_fails_the_magic_check() {
        let mut rng = XorShiftEntropy(43);
        let (raw, _ctx) = build_header(&mut rng, &spec(Some(b"right".as_slice())), None).unwrap();
        let err = decrypt_header(&raw, b"wrong", Kdf::Sha512, 1, CipherKind::Aes).unwrap_err();
        assert!(matches!(err, FormatError::Header(HeaderError::InvalidMagic)));
    }

    #[test]
    fn backup_header_shares_keys_but_not_bytes() {
        let mut rng = XorShiftEntropy(44);
        let spec = spec(Some(b"pw".as_slice()));
        let (primary, ctx) = build_header(&mut rng, &spec, None).unwrap();
        let (backup, backup_ctx) = build_header(&mut rng, &spec, Some(ctx.master_keydata())).unwrap();

        // fresh salt means fresh ciphertext
        assert_ne!(primary[..], backup[..]);
        assert_eq!(ctx.master_keydata(), backup_ctx.master_keydata());

        let a = decrypt_header(&primary, b"pw", spec.kdf, spec.pim, spec.cipher).unwrap();
        let b = decrypt_header(&backup, b"pw", spec.kdf, spec.pim, spec.cipher).unwrap();
        assert_eq!(a.master_keydata, b.master_keydata);
        assert_eq!(a.volume_data_size, b.volume_data_size);
    }

    #[test]
    fn decoy_header_is_not_empty_password_decryptable() {
        let mut rng = XorShiftEntropy(45);
        let mut decoy_spec = spec(None);
        decoy_spec.hidden_volume_size = decoy_spec.data_area_size;
        let (raw, _ctx) = build_header(&mut rng, &decoy_spec, None).unwrap();

        assert!(decrypt_header(&raw, b"", Kdf::Sha512, 1, CipherKind::Aes).is_err());
    }

    #[test]
    fn corrupted_payload_is_rejected_by_crc() {
        let mut rng = XorShiftEntropy(46);
        let spec = spec(Some(b"pw".as_slice()));
        let (raw, _ctx) = build_header(&mut rng, &spec, None).unwrap();

        // decrypt manually, flip a field byte, re-check
        let ks = spec.cipher.key_size();
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&raw[..SALT_SIZE]);
        let mut hk = Zeroizing::new([0u8; HEADER_KEY_SIZE]);
        derive_header_key(spec.kdf, b"pw", &salt, spec.pim, &mut hk[..]).unwrap();
        let cipher = VolumeCipher::new(spec.cipher, &hk[..ks], &hk[ks..2 * ks]).unwrap();
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&raw[SALT_SIZE..]);
        cipher.decrypt_block(&mut payload, 0);

        payload[36] ^= 0xff;
        assert!(matches!(
            VolumeHeader::deserialize(&payload),
            Err(HeaderError::InvalidCrc)
        ));
    }
}
