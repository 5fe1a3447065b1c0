// volformat: encrypted volume formatter.
//
// Creates encrypted containers (file-backed, or raw devices behind the
// `Target` trait) with VeraCrypt-compatible volume headers: a primary and
// a backup header sharing one set of master keys, an XTS-encrypted data
// area whose tweak numbering is absolute from byte 0 of the container,
// decoy hidden-volume headers in every standard container, an optional
// full fill under throwaway keys, and an optional FAT filesystem written
// straight through the encrypted path.
//
// The cipher primitives, key derivation, randomness and host-OS
// filesystem formatting are collaborators; this crate sequences them and
// owns the on-disk layout.

pub mod crypto;
pub mod device;
pub mod fat;
pub mod fill;
pub mod format;
pub mod header;
pub mod kdf;
pub mod layout;
pub mod rng;
pub mod writer;

pub use crypto::{CipherKind, CryptoContext};
pub use device::{FileTarget, OpenRequest, Target};
pub use format::{
    format_volume, FilesystemKind, FormatError, FormatSummary, HostFilesystem, HostMount,
    Interaction, Progress, Prompt, VolumeParameters,
};
pub use header::{build_header, decrypt_header, HeaderError, HeaderSpec, VolumeHeader};
pub use kdf::Kdf;
pub use layout::VolumeLayout;
pub use rng::{EntropySource, OsEntropy};
