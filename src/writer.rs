// Encrypted sector stream and the background write pipeline.
//
// The writer collects plaintext sectors into a buffer, encrypts the
// buffer as whole data units on flush and hands the ciphertext either
// straight to the target (file containers) or to the pipeline worker
// (device containers). Tweak numbering depends only on the absolute
// sector counter, never on buffering.
//
// The pipeline is a strict ping-pong: the producer owns the slot while it
// is empty, the worker owns it while it is full. Two condition variables
// play the role of the empty/full event pair, so no additional locking is
// needed around the buffer, the request size or the result code. Writes
// reach the device in submission order.

use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::crypto::CryptoContext;
use crate::device::Target;
use crate::format::{FormatError, Progress};
use crate::layout::{DATA_UNIT_SIZE, WRITE_BUFFER_SIZE};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(25);

struct PipelineSlot {
    buf: Vec<u8>,
    len: usize,
    full: bool,
    exit: bool,
    result: Option<io::Error>,
}

struct PipelineShared {
    slot: Mutex<PipelineSlot>,
    empty: Condvar,
    full: Condvar,
}

fn lock(m: &Mutex<PipelineSlot>) -> MutexGuard<'_, PipelineSlot> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct WritePipeline<'scope> {
    shared: Arc<PipelineShared>,
    worker: Option<thread::ScopedJoinHandle<'scope, ()>>,
}

impl<'scope> WritePipeline<'scope> {
    pub fn start<'env>(
        scope: &'scope thread::Scope<'scope, 'env>,
        target: &'scope mut (dyn Target + 'scope),
    ) -> Result<WritePipeline<'scope>, FormatError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(WRITE_BUFFER_SIZE)
            .map_err(|_| FormatError::OutOfMemory)?;

        let shared = Arc::new(PipelineShared {
            slot: Mutex::new(PipelineSlot {
                buf,
                len: 0,
                full: false,
                exit: false,
                result: None,
            }),
            empty: Condvar::new(),
            full: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = scope.spawn(move || worker_loop(worker_shared, target));

        Ok(WritePipeline {
            shared,
            worker: Some(worker),
        })
    }

    // Hand one encrypted buffer to the worker. Blocks until the slot is
    // empty; a failure of the previous write surfaces here.
    pub fn submit(&self, data: &[u8]) -> Result<(), FormatError> {
        debug_assert!(data.len() <= WRITE_BUFFER_SIZE);

        let mut slot = lock(&self.shared.slot);
        while slot.full {
            slot = self.shared.empty.wait(slot).unwrap_or_else(|e| e.into_inner());
        }

        if let Some(err) = slot.result.take() {
            return Err(FormatError::OsError(err));
        }

        slot.buf.clear();
        slot.buf.extend_from_slice(data);
        slot.len = data.len();
        slot.full = true;
        self.shared.full.notify_one();
        Ok(())
    }

    // Drain the last write, stop the worker and report its final status.
    pub fn stop(mut self) -> Result<(), FormatError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), FormatError> {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return Ok(()),
        };

        {
            let mut slot = lock(&self.shared.slot);
            while slot.full {
                slot = self.shared.empty.wait(slot).unwrap_or_else(|e| e.into_inner());
            }
            slot.exit = true;
            self.shared.full.notify_one();
        }

        if worker.join().is_err() {
            return Err(FormatError::OsError(io::Error::new(
                io::ErrorKind::Other,
                "format write thread panicked",
            )));
        }

        let mut slot = lock(&self.shared.slot);
        match slot.result.take() {
            Some(err) => Err(FormatError::OsError(err)),
            None => Ok(()),
        }
    }
}

impl Drop for WritePipeline<'_> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn worker_loop(shared: Arc<PipelineShared>, target: &mut (dyn Target + '_)) {
    let mut slot = lock(&shared.slot);
    loop {
        while !slot.full && !slot.exit {
            slot = shared.full.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
        if slot.exit {
            break;
        }

        // Take the buffer out so the device write runs without the lock.
        // Ownership is safe: the producer never touches a full slot.
        let buf = mem::take(&mut slot.buf);
        let len = slot.len;
        drop(slot);

        let result = target.write_all(&buf[..len]);

        slot = lock(&shared.slot);
        slot.buf = buf;
        if let Err(err) = result {
            if slot.result.is_none() {
                slot.result = Some(err);
            }
        }
        slot.full = false;
        shared.empty.notify_one();
    }
}

enum Sink<'a, 'scope> {
    Direct(&'a mut (dyn Target + 'a)),
    Pipelined(&'a WritePipeline<'scope>),
}

pub struct SectorWriter<'a, 'scope> {
    sink: Sink<'a, 'scope>,
    sector_size: usize,
    buf: Vec<u8>,
    buf_cap: usize,
    n_sec: u64,
    progress: &'a mut dyn Progress,
    last_report: Option<Instant>,
}

impl<'a, 'scope> SectorWriter<'a, 'scope> {
    pub fn direct(
        target: &'a mut (dyn Target + 'a),
        sector_size: u32,
        start_sector: u64,
        progress: &'a mut dyn Progress,
    ) -> Result<SectorWriter<'a, 'scope>, FormatError> {
        Self::new(Sink::Direct(target), sector_size, start_sector, progress)
    }

    pub fn pipelined(
        pipeline: &'a WritePipeline<'scope>,
        sector_size: u32,
        start_sector: u64,
        progress: &'a mut dyn Progress,
    ) -> Result<SectorWriter<'a, 'scope>, FormatError> {
        Self::new(Sink::Pipelined(pipeline), sector_size, start_sector, progress)
    }

    fn new(
        sink: Sink<'a, 'scope>,
        sector_size: u32,
        start_sector: u64,
        progress: &'a mut dyn Progress,
    ) -> Result<SectorWriter<'a, 'scope>, FormatError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(WRITE_BUFFER_SIZE)
            .map_err(|_| FormatError::OutOfMemory)?;

        Ok(SectorWriter {
            sink,
            sector_size: sector_size as usize,
            buf,
            buf_cap: WRITE_BUFFER_SIZE,
            n_sec: start_sector,
            progress,
            last_report: None,
        })
    }

    #[cfg(test)]
    fn with_buffer_size(mut self, cap: usize) -> SectorWriter<'a, 'scope> {
        assert_eq!(cap % self.sector_size, 0);
        self.buf_cap = cap;
        self
    }

    // Absolute sector number one past the last sector accepted.
    pub fn sector(&self) -> u64 {
        self.n_sec
    }

    pub fn write_sector(&mut self, ctx: &CryptoContext, sector: &[u8]) -> Result<(), FormatError> {
        debug_assert_eq!(sector.len(), self.sector_size);

        self.n_sec += 1;
        self.buf.extend_from_slice(sector);
        if self.buf.len() >= self.buf_cap {
            self.flush(ctx)?;
        }

        let due = match self.last_report {
            None => true,
            Some(at) => at.elapsed() >= PROGRESS_INTERVAL,
        };
        if due {
            if !self.progress.report(self.n_sec * self.sector_size as u64) {
                return Err(FormatError::Cancelled);
            }
            self.last_report = Some(Instant::now());
        }
        Ok(())
    }

    // Advance the sector counter without writing; used by quick formats so
    // progress jumps over the untouched span.
    pub fn skip_sectors(&mut self, count: u64) {
        debug_assert!(self.buf.is_empty());
        self.n_sec += count;
    }

    pub fn flush(&mut self, ctx: &CryptoContext) -> Result<(), FormatError> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let first_unit =
            (self.n_sec * self.sector_size as u64 - self.buf.len() as u64) / DATA_UNIT_SIZE as u64;
        ctx.encrypt_data_units(&mut self.buf, first_unit);

        match &mut self.sink {
            Sink::Direct(target) => target.write_all(&self.buf).map_err(FormatError::OsError)?,
            Sink::Pipelined(pipeline) => pipeline.submit(&self.buf)?,
        }

        self.buf.clear();
        Ok(())
    }

    // Flush the residual buffer and emit a final progress report.
    pub fn complete(&mut self, ctx: &CryptoContext) -> Result<(), FormatError> {
        self.flush(ctx)?;
        if !self.progress.report(self.n_sec * self.sector_size as u64) {
            return Err(FormatError::Cancelled);
        }
        self.last_report = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;
    use crate::device::OpenRequest;
    use crate::layout::MASTER_KEYDATA_SIZE;

    struct VecTarget {
        data: Vec<u8>,
        pos: usize,
    }

    impl VecTarget {
        fn new() -> VecTarget {
            VecTarget { data: Vec::new(), pos: 0 }
        }
    }

    impl Target for VecTarget {
        fn open(&mut self, _req: &OpenRequest) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn seek(&mut self, offset: u64) -> io::Result<()> {
            self.pos = offset as usize;
            Ok(())
        }
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            let end = self.pos + buf.len();
            if end > self.data.len() {
                self.data.resize(end, 0);
            }
            self.data[self.pos..end].copy_from_slice(buf);
            self.pos = end;
            Ok(())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn preallocate(&mut self, size: u64) -> io::Result<()> {
            self.data.resize(size as usize, 0);
            Ok(())
        }
        fn truncate_to_zero(&mut self) -> io::Result<()> {
            self.data.clear();
            self.pos = 0;
            Ok(())
        }
    }

    struct CountingProgress {
        reports: u64,
        cancel_after: Option<u64>,
    }

    impl Progress for CountingProgress {
        fn report(&mut self, _bytes_done: u64) -> bool {
            self.reports += 1;
            match self.cancel_after {
                Some(n) => self.reports <= n,
                None => true,
            }
        }
    }

    fn ctx() -> CryptoContext {
        let mut keydata = [0u8; MASTER_KEYDATA_SIZE];
        for (i, b) in keydata.iter_mut().enumerate() {
            *b = (i * 13 % 256) as u8;
        }
        CryptoContext::new(CipherKind::Aes, &keydata).unwrap()
    }

    fn run_with_buffer(cap: usize, sectors: usize) -> Vec<u8> {
        let ctx = ctx();
        let mut target = VecTarget::new();
        let mut progress = CountingProgress { reports: 0, cancel_after: None };
        let mut writer = SectorWriter::direct(&mut target, 512, 256, &mut progress)
            .unwrap()
            .with_buffer_size(cap);
        for i in 0..sectors {
            let sector = [i as u8; 512];
            writer.write_sector(&ctx, &sector).unwrap();
        }
        writer.complete(&ctx).unwrap();
        target.data
    }

    #[test]
    fn ciphertext_does_not_depend_on_flush_boundaries() {
        let a = run_with_buffer(2048, 23);
        let b = run_with_buffer(4096, 23);
        let c = run_with_buffer(8192, 23);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.len(), 23 * 512);
    }

    #[test]
    fn unit_numbering_starts_at_the_start_sector() {
        let ctx = ctx();
        let data = run_with_buffer(4096, 4);

        // decrypting with the same absolute unit numbers restores the plaintext
        let mut buf = data.clone();
        ctx.decrypt_data_units(&mut buf, 256);
        for (i, chunk) in buf.chunks(512).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn cancellation_surfaces_as_an_error() {
        let ctx = ctx();
        let mut target = VecTarget::new();
        let mut progress = CountingProgress { reports: 0, cancel_after: Some(0) };
        let mut writer = SectorWriter::direct(&mut target, 512, 0, &mut progress).unwrap();

        let sector = [0u8; 512];
        assert!(matches!(
            writer.write_sector(&ctx, &sector),
            Err(FormatError::Cancelled)
        ));
    }

    #[test]
    fn pipeline_preserves_submission_order() {
        let mut target = VecTarget::new();
        thread::scope(|s| {
            let pipeline = WritePipeline::start(s, &mut target).unwrap();
            for i in 0..8u8 {
                pipeline.submit(&[i; 1024]).unwrap();
            }
            pipeline.stop().unwrap();
        });
        assert_eq!(target.data.len(), 8 * 1024);
        for (i, chunk) in target.data.chunks(1024).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn pipelined_writer_matches_direct_writer() {
        let ctx = ctx();

        let direct = run_with_buffer(4096, 9);

        let mut target = VecTarget::new();
        let mut progress = CountingProgress { reports: 0, cancel_after: None };
        thread::scope(|s| {
            let pipeline = WritePipeline::start(s, &mut target).unwrap();
            let mut writer = SectorWriter::pipelined(&pipeline, 512, 256, &mut progress)
                .unwrap()
                .with_buffer_size(4096);
            for i in 0..9 {
                writer.write_sector(&ctx, &[i as u8; 512]).unwrap();
            }
            writer.complete(&ctx).unwrap();
            drop(writer);
            pipeline.stop().unwrap();
        });

        assert_eq!(direct, target.data);
    }
}
