// Data-area fill.
//
// A full format overwrites every data sector with the encryption of an
// all-zero sector under a throwaway random key set, so the area is
// indistinguishable from random to anyone without the keys (hidden-volume
// deniability). The context's real master keys are reinstalled before
// returning on every path, so header writes and a possible format retry
// always run under the real keys.

use zeroize::Zeroizing;

use crate::crypto::{CryptoContext, MAX_KEY_SIZE};
use crate::format::FormatError;
use crate::rng::EntropySource;
use crate::writer::SectorWriter;

pub fn fill_data_area(
    writer: &mut SectorWriter<'_, '_>,
    ctx: &mut CryptoContext,
    rng: &mut dyn EntropySource,
    num_sectors: u64,
    sector_size: u32,
    quick: bool,
) -> Result<(), FormatError> {
    if quick {
        writer.skip_sectors(num_sectors);
        return Ok(());
    }

    let key_size = ctx.kind().key_size();

    let mut original_k2 = Zeroizing::new([0u8; MAX_KEY_SIZE]);
    original_k2[..key_size].copy_from_slice(ctx.secondary_key());

    let mut temporary_key = Zeroizing::new([0u8; MAX_KEY_SIZE]);
    let mut temporary_k2 = Zeroizing::new([0u8; MAX_KEY_SIZE]);
    rng.fill(&mut temporary_key[..key_size], false)?;
    rng.fill(&mut temporary_k2[..key_size], false)?;

    ctx.set_keys(&temporary_key[..key_size], &temporary_k2[..key_size])?;

    let result = (|| {
        let sector = vec![0u8; sector_size as usize];
        for _ in 0..num_sectors {
            writer.write_sector(ctx, &sector)?;
        }
        // flush while the temporary keys are still installed
        writer.flush(ctx)
    })();

    // Reinstall the real keys whether or not the fill succeeded; the
    // temporary buffers are zeroized on drop.
    let mut master_primary = Zeroizing::new([0u8; MAX_KEY_SIZE]);
    master_primary[..key_size].copy_from_slice(&ctx.master_keydata()[..key_size]);
    let restored = ctx.set_keys(&master_primary[..key_size], &original_k2[..key_size]);

    result.and(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;
    use crate::format::Progress;
    use crate::layout::MASTER_KEYDATA_SIZE;

    struct NullProgress;

    impl Progress for NullProgress {
        fn report(&mut self, _bytes_done: u64) -> bool {
            true
        }
    }

    struct PatternEntropy(u8);

    impl EntropySource for PatternEntropy {
        fn fill(&mut self, dst: &mut [u8], _strong: bool) -> Result<(), FormatError> {
            for b in dst {
                self.0 = self.0.wrapping_mul(167).wrapping_add(41);
                *b = self.0;
            }
            Ok(())
        }
    }

    struct SinkTarget {
        data: Vec<u8>,
    }

    impl crate::device::Target for SinkTarget {
        fn open(&mut self, _req: &crate::device::OpenRequest) -> std::io::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn seek(&mut self, _offset: u64) -> std::io::Result<()> {
            Ok(())
        }
        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.data.extend_from_slice(buf);
            Ok(())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn preallocate(&mut self, _size: u64) -> std::io::Result<()> {
            Ok(())
        }
        fn truncate_to_zero(&mut self) -> std::io::Result<()> {
            self.data.clear();
            Ok(())
        }
    }

    fn ctx() -> CryptoContext {
        let mut keydata = [0u8; MASTER_KEYDATA_SIZE];
        for (i, b) in keydata.iter_mut().enumerate() {
            *b = (i * 3 % 256) as u8;
        }
        CryptoContext::new(CipherKind::Aes, &keydata).unwrap()
    }

    #[test]
    fn full_fill_does_not_use_the_volume_key() {
        let mut ctx = ctx();
        let mut rng = PatternEntropy(7);
        let mut target = SinkTarget { data: Vec::new() };
        let mut progress = NullProgress;

        {
            let mut writer = SectorWriter::direct(&mut target, 512, 0, &mut progress).unwrap();
            fill_data_area(&mut writer, &mut ctx, &mut rng, 64, 512, false).unwrap();
        }

        assert_eq!(target.data.len(), 64 * 512);
        assert!(target.data.iter().any(|&b| b != 0));

        // decrypting with the real master key must not yield the zero plaintext
        let mut first = target.data[..512].to_vec();
        ctx.decrypt_data_units(&mut first, 0);
        assert!(first.iter().any(|&b| b != 0));
    }

    #[test]
    fn master_schedules_are_restored_after_the_fill() {
        let mut ctx = ctx();
        let mut reference = [0x11u8; 512];
        ctx.encrypt_data_units(&mut reference, 5);

        let mut rng = PatternEntropy(9);
        let mut target = SinkTarget { data: Vec::new() };
        let mut progress = NullProgress;
        {
            let mut writer = SectorWriter::direct(&mut target, 512, 0, &mut progress).unwrap();
            fill_data_area(&mut writer, &mut ctx, &mut rng, 8, 512, false).unwrap();
        }

        let mut after = [0x11u8; 512];
        ctx.encrypt_data_units(&mut after, 5);
        assert_eq!(reference, after);
    }

    #[test]
    fn quick_fill_writes_nothing() {
        let mut ctx = ctx();
        let mut rng = PatternEntropy(11);
        let mut target = SinkTarget { data: Vec::new() };
        let mut progress = NullProgress;
        {
            let mut writer = SectorWriter::direct(&mut target, 512, 0, &mut progress).unwrap();
            fill_data_area(&mut writer, &mut ctx, &mut rng, 1000, 512, true).unwrap();
            assert_eq!(writer.sector(), 1000);
        }
        assert!(target.data.is_empty());
    }
}
