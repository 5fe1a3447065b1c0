#![allow(dead_code)]

// Shared test doubles: an in-memory container target, a deterministic
// entropy source and a parameter builder.

use std::io;

use volformat::{
    CipherKind, FilesystemKind, FormatError, Kdf, OpenRequest, Target, VolumeParameters,
};

pub struct MemTarget {
    pub data: Vec<u8>,
    pub pos: usize,
    pub open: bool,
    pub device: bool,
    // how often a write touched the primary header slot at offset 0
    pub primary_slot_writes: u32,
}

impl MemTarget {
    pub fn new() -> MemTarget {
        MemTarget {
            data: Vec::new(),
            pos: 0,
            open: false,
            device: false,
            primary_slot_writes: 0,
        }
    }

    pub fn with_content(data: Vec<u8>) -> MemTarget {
        MemTarget {
            data,
            pos: 0,
            open: false,
            device: false,
            primary_slot_writes: 0,
        }
    }
}

impl Target for MemTarget {
    fn open(&mut self, req: &OpenRequest) -> io::Result<()> {
        if req.create {
            self.data.clear();
        }
        self.pos = 0;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.open = false;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        self.pos = offset as usize;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        if self.pos < 512 {
            self.primary_slot_writes += 1;
        }
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

    fn is_device(&self) -> bool {
        self.device
    }
}

pub struct TestEntropy(pub u64);

impl volformat::EntropySource for TestEntropy {
    fn fill(&mut self, dst: &mut [u8], _strong: bool) -> Result<(), FormatError> {
        for b in dst {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            *b = (self.0 >> 32) as u8;
        }
        Ok(())
    }
}

pub const PASSWORD: &[u8] = b"correct horse battery staple";

pub fn params(size: u64) -> VolumeParameters<'static> {
    VolumeParameters {
        size,
        hidden_host_size: None,
        filesystem: FilesystemKind::None,
        quick_format: false,
        sparse: false,
        fast_create: false,
        cluster_size: 0,
        sector_size: 512,
        cipher: CipherKind::Aes,
        kdf: Kdf::Sha512,
        // keep the KDF cheap in tests
        pim: 1,
        password: PASSWORD,
        header_flags: 0,
        preserve_timestamps: false,
        force: false,
    }
}
