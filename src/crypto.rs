// Cipher selection and the XTS data-unit pipeline.
//
// Key material layout follows the volume header's 256-byte key area: the
// primary keys of every cascade layer first (inner layer first), then the
// secondary (tweak) keys in the same order. Encryption applies the layers
// in layout order; decryption reverses them.

use aes::Aes256;
use cipher::{BlockCipher, BlockDecrypt, BlockEncrypt, KeyInit};
use serpent::Serpent;
use twofish::Twofish;
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use crate::format::FormatError;
use crate::layout::{DATA_UNIT_SIZE, MASTER_KEYDATA_SIZE};

// Key size of one cascade layer. All supported primitives take 256-bit keys.
pub const LAYER_KEY_SIZE: usize = 32;
// Largest primary (or secondary) key: a three-cipher cascade.
pub const MAX_KEY_SIZE: usize = 3 * LAYER_KEY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    Aes,
    Serpent,
    Twofish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes,
    Serpent,
    Twofish,
    AesTwofish,
    AesTwofishSerpent,
    SerpentAes,
    TwofishSerpent,
    SerpentTwofishAes,
}

impl CipherKind {
    // Layers in encryption order (inner first), matching the key layout.
    // Cascade names list the outer cipher first.
    fn layers(self) -> &'static [Primitive] {
        use Primitive::*;
        match self {
            CipherKind::Aes => &[Aes],
            CipherKind::Serpent => &[Serpent],
            CipherKind::Twofish => &[Twofish],
            CipherKind::AesTwofish => &[Twofish, Aes],
            CipherKind::AesTwofishSerpent => &[Serpent, Twofish, Aes],
            CipherKind::SerpentAes => &[Aes, Serpent],
            CipherKind::TwofishSerpent => &[Serpent, Twofish],
            CipherKind::SerpentTwofishAes => &[Aes, Twofish, Serpent],
        }
    }

    pub fn depth(self) -> usize {
        self.layers().len()
    }

    // Total primary key bytes; the secondary keys take the same amount.
    pub fn key_size(self) -> usize {
        self.depth() * LAYER_KEY_SIZE
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes => "AES",
            CipherKind::Serpent => "Serpent",
            CipherKind::Twofish => "Twofish",
            CipherKind::AesTwofish => "AES-Twofish",
            CipherKind::AesTwofishSerpent => "AES-Twofish-Serpent",
            CipherKind::SerpentAes => "Serpent-AES",
            CipherKind::TwofishSerpent => "Twofish-Serpent",
            CipherKind::SerpentTwofishAes => "Serpent-Twofish-AES",
        }
    }
}

enum CipherLayer {
    Aes(Xts128<Aes256>),
    Serpent(Xts128<Serpent>),
    Twofish(Xts128<Twofish>),
}

impl CipherLayer {
    fn new(primitive: Primitive, k1: &[u8], k2: &[u8]) -> Result<CipherLayer, FormatError> {
        fn pair<C>(k1: &[u8], k2: &[u8]) -> Result<Xts128<C>, FormatError>
        where
            C: KeyInit + BlockEncrypt + BlockDecrypt + BlockCipher,
        {
            let c1 = C::new_from_slice(k1).map_err(|_| FormatError::ModeInitFailed)?;
            let c2 = C::new_from_slice(k2).map_err(|_| FormatError::ModeInitFailed)?;
            Ok(Xts128::new(c1, c2))
        }

        Ok(match primitive {
            Primitive::Aes => CipherLayer::Aes(pair::<Aes256>(k1, k2)?),
            Primitive::Serpent => CipherLayer::Serpent(pair::<Serpent>(k1, k2)?),
            Primitive::Twofish => CipherLayer::Twofish(pair::<Twofish>(k1, k2)?),
        })
    }

    fn encrypt_area(&self, area: &mut [u8], unit_size: usize, first_unit: u128) {
        match self {
            CipherLayer::Aes(x) => x.encrypt_area(area, unit_size, first_unit, get_tweak_default),
            CipherLayer::Serpent(x) => x.encrypt_area(area, unit_size, first_unit, get_tweak_default),
            CipherLayer::Twofish(x) => x.encrypt_area(area, unit_size, first_unit, get_tweak_default),
        }
    }

    fn decrypt_area(&self, area: &mut [u8], unit_size: usize, first_unit: u128) {
        match self {
            CipherLayer::Aes(x) => x.decrypt_area(area, unit_size, first_unit, get_tweak_default),
            CipherLayer::Serpent(x) => x.decrypt_area(area, unit_size, first_unit, get_tweak_default),
            CipherLayer::Twofish(x) => x.decrypt_area(area, unit_size, first_unit, get_tweak_default),
        }
    }
}

pub struct VolumeCipher {
    layers: Vec<CipherLayer>,
}

impl VolumeCipher {
    pub fn new(kind: CipherKind, primary: &[u8], secondary: &[u8]) -> Result<VolumeCipher, FormatError> {
        let ks = kind.key_size();
        if primary.len() < ks || secondary.len() < ks {
            return Err(FormatError::ModeInitFailed);
        }

        let mut layers = Vec::with_capacity(kind.depth());
        for (i, &primitive) in kind.layers().iter().enumerate() {
            let k1 = &primary[i * LAYER_KEY_SIZE..(i + 1) * LAYER_KEY_SIZE];
            let k2 = &secondary[i * LAYER_KEY_SIZE..(i + 1) * LAYER_KEY_SIZE];
            layers.push(CipherLayer::new(primitive, k1, k2)?);
        }

        Ok(VolumeCipher { layers })
    }

    // Encrypt whole 512-byte data units. `first_unit` is the absolute unit
    // number of `data[0]`, counted from byte 0 of the container.
    pub fn encrypt_data_units(&self, data: &mut [u8], first_unit: u64) {
        debug_assert_eq!(data.len() % DATA_UNIT_SIZE as usize, 0);
        for layer in &self.layers {
            layer.encrypt_area(data, DATA_UNIT_SIZE as usize, first_unit as u128);
        }
    }

    pub fn decrypt_data_units(&self, data: &mut [u8], first_unit: u64) {
        debug_assert_eq!(data.len() % DATA_UNIT_SIZE as usize, 0);
        for layer in self.layers.iter().rev() {
            layer.decrypt_area(data, DATA_UNIT_SIZE as usize, first_unit as u128);
        }
    }

    // Encrypt a buffer as a single XTS unit (the 448-byte header region is
    // always one unit with tweak 0).
    pub fn encrypt_block(&self, block: &mut [u8], unit_no: u64) {
        for layer in &self.layers {
            layer.encrypt_area(block, block.len(), unit_no as u128);
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8], unit_no: u64) {
        for layer in self.layers.iter().rev() {
            layer.decrypt_area(block, block.len(), unit_no as u128);
        }
    }
}

// An XTS key pair is degenerate when the primary and secondary halves
// match; freshly drawn master keys are redrawn on this.
pub fn xts_key_vulnerable(keydata: &[u8], key_size: usize) -> bool {
    keydata.len() >= 2 * key_size && keydata[..key_size] == keydata[key_size..2 * key_size]
}

// The formatter's live key state: the real master key material plus the
// currently installed cipher schedules. During a full-format fill the
// schedules temporarily run under random throwaway keys while
// `master_keydata` keeps the real ones for the later header writes.
pub struct CryptoContext {
    kind: CipherKind,
    master_keydata: Zeroizing<[u8; MASTER_KEYDATA_SIZE]>,
    k2: Zeroizing<[u8; MAX_KEY_SIZE]>,
    cipher: VolumeCipher,
    pub hidden_volume_offset: Option<u64>,
}

impl CryptoContext {
    pub fn new(kind: CipherKind, master_keydata: &[u8; MASTER_KEYDATA_SIZE]) -> Result<CryptoContext, FormatError> {
        let ks = kind.key_size();
        let cipher = VolumeCipher::new(kind, &master_keydata[..ks], &master_keydata[ks..2 * ks])?;

        let mut k2 = Zeroizing::new([0u8; MAX_KEY_SIZE]);
        k2[..ks].copy_from_slice(&master_keydata[ks..2 * ks]);

        Ok(CryptoContext {
            kind,
            master_keydata: Zeroizing::new(*master_keydata),
            k2,
            cipher,
            hidden_volume_offset: None,
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn master_keydata(&self) -> &[u8; MASTER_KEYDATA_SIZE] {
        &self.master_keydata
    }

    pub fn secondary_key(&self) -> &[u8] {
        &self.k2[..self.kind.key_size()]
    }

    // Re-initialize the cipher schedules from an arbitrary key pair. The
    // master key material is left untouched, so `set_keys` with the saved
    // originals undoes a temporary-key installation.
    pub fn set_keys(&mut self, primary: &[u8], secondary: &[u8]) -> Result<(), FormatError> {
        let ks = self.kind.key_size();
        if primary.len() != ks || secondary.len() != ks {
            return Err(FormatError::ModeInitFailed);
        }

        let cipher = VolumeCipher::new(self.kind, primary, secondary)?;
        self.k2[..ks].copy_from_slice(secondary);
        self.cipher = cipher;
        Ok(())
    }

    pub fn encrypt_data_units(&self, data: &mut [u8], first_unit: u64) {
        self.cipher.encrypt_data_units(data, first_unit)
    }

    pub fn decrypt_data_units(&self, data: &mut [u8], first_unit: u64) {
        self.cipher.decrypt_data_units(data, first_unit)
    }
}
