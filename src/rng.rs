// Entropy collaborator. The formatter never generates randomness itself;
// everything (salts, master keys, temporary fill keys, reserved-area
// noise) is drawn through this trait so tests can substitute a
// deterministic source.

use rand::rngs::OsRng;
use rand::RngCore;
use std::io;

use crate::format::FormatError;

pub trait EntropySource {
    // `strong` marks key material as opposed to statistical filler.
    fn fill(&mut self, dst: &mut [u8], strong: bool) -> Result<(), FormatError>;
}

// Operating-system CSPRNG.
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&mut self, dst: &mut [u8], _strong: bool) -> Result<(), FormatError> {
        OsRng
            .try_fill_bytes(dst)
            .map_err(|e| FormatError::OsError(io::Error::new(io::ErrorKind::Other, e)))
    }
}
