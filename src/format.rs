// Format orchestrator.
//
// Drives a single volume format from parameter validation to the final
// decoy headers: acquire the target, write the primary header, fill or
// quick-format the data area (through the write pipeline for devices),
// write the backup header, randomize the reserved header areas and plant
// the decoy hidden headers. NTFS/exFAT/ReFS are delegated to the host OS
// after the container exists; when that fails and FAT would fit, the
// format is retried in place as FAT without touching the headers again.
//
// Every attempt funnels through one release path that truncates failed
// file-backed creations, flushes, restores captured timestamps and closes
// the handle without masking the original error.

use std::fmt;
use std::io;
use std::thread;
use std::time::Duration;

use crate::crypto::{CipherKind, CryptoContext};
use crate::device::{OpenRequest, Target};
use crate::fat::FatParams;
use crate::fill;
use crate::header::{build_header, HeaderError, HeaderSpec};
use crate::kdf::Kdf;
use crate::layout::{
    VolumeLayout, DATA_OFFSET, HEADER_EFFECTIVE_SIZE, HEADER_GROUP_SIZE, HIDDEN_HEADER_OFFSET,
    MAX_FAT_SECTOR_COUNT, SECTOR_SIZE_MAX,
};
use crate::rng::EntropySource;
use crate::writer::{SectorWriter, WritePipeline};

// Exclusive device opens usually succeed after a few tries.
const EXCLUSIVE_OPEN_RETRIES: u32 = 10;
const EXCLUSIVE_OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum FormatError {
    OsError(io::Error),
    OutOfMemory,
    VolSizeWrong,
    ParameterIncorrect,
    ModeInitFailed,
    VolMountFailed,
    NoFreeDrives,
    // the failure was already surfaced to the user through a callback
    DontReport,
    SectorSizeUnsupported,
    Cancelled,
    Header(HeaderError),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::OsError(e) => write!(f, "operating system error: {}", e),
            FormatError::OutOfMemory => write!(f, "out of memory"),
            FormatError::VolSizeWrong => write!(f, "volume size is invalid"),
            FormatError::ParameterIncorrect => write!(f, "parameter is incorrect"),
            FormatError::ModeInitFailed => write!(f, "encryption mode initialization failed"),
            FormatError::VolMountFailed => write!(f, "volume could not be mounted"),
            FormatError::NoFreeDrives => write!(f, "no free drive slot"),
            FormatError::DontReport => write!(f, "operation aborted"),
            FormatError::SectorSizeUnsupported => write!(f, "sector size is unsupported"),
            FormatError::Cancelled => write!(f, "cancelled by user"),
            FormatError::Header(e) => write!(f, "volume header error: {}", e),
        }
    }
}

impl std::error::Error for FormatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormatError::OsError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FormatError {
    fn from(e: io::Error) -> FormatError {
        FormatError::OsError(e)
    }
}

impl From<HeaderError> for FormatError {
    fn from(e: HeaderError) -> FormatError {
        FormatError::Header(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    None,
    Fat,
    Ntfs,
    Exfat,
    Refs,
}

impl FilesystemKind {
    fn host_formatted(self) -> bool {
        matches!(self, FilesystemKind::Ntfs | FilesystemKind::Exfat | FilesystemKind::Refs)
    }
}

// Immutable description of the requested volume. For hidden volumes,
// `size` is the inner volume size and `hidden_host_size` carries the size
// of the existing host container.
pub struct VolumeParameters<'a> {
    pub size: u64,
    pub hidden_host_size: Option<u64>,
    pub filesystem: FilesystemKind,
    pub quick_format: bool,
    pub sparse: bool,
    // Opt-in: skip zero-filling the preallocated file. Leaks previous disk
    // contents into the container until overwritten.
    pub fast_create: bool,
    // cluster size in sectors, 0 selects the default
    pub cluster_size: u32,
    pub sector_size: u32,
    pub cipher: CipherKind,
    pub kdf: Kdf,
    pub pim: u32,
    pub password: &'a [u8],
    pub header_flags: u32,
    pub preserve_timestamps: bool,
    // proceed without asking when only shared access is available
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSummary {
    // cluster size in bytes realized by the FAT layer, 0 otherwise
    pub real_cluster_size: u32,
    pub retried_as_fat: bool,
}

pub trait Progress {
    // Returns false to cancel the format.
    fn report(&mut self, bytes_done: u64) -> bool;
}

impl Progress for () {
    fn report(&mut self, _bytes_done: u64) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    RetryWithFat,
    SharedModeFormat,
    FastCreateWithoutPrivilege,
}

pub trait Interaction {
    fn confirm(&mut self, prompt: Prompt) -> bool;
}

impl Interaction for () {
    fn confirm(&mut self, _prompt: Prompt) -> bool {
        false
    }
}

// Drive slot handed out by the host-filesystem collaborator.
pub struct HostMount(pub u32);

// Host-OS filesystem formatting: mount the freshly created container,
// let the host format it, unmount. Only consulted for NTFS/exFAT/ReFS.
pub trait HostFilesystem {
    fn mount(&mut self, params: &VolumeParameters<'_>) -> Result<HostMount, FormatError>;
    fn format(&mut self, mount: &HostMount, cluster_size_sectors: u32, filesystem: FilesystemKind) -> bool;
    fn unmount(&mut self, mount: HostMount) -> bool;
}

impl HostFilesystem for () {
    fn mount(&mut self, _params: &VolumeParameters<'_>) -> Result<HostMount, FormatError> {
        Err(FormatError::VolMountFailed)
    }
    fn format(&mut self, _mount: &HostMount, _cluster: u32, _fs: FilesystemKind) -> bool {
        false
    }
    fn unmount(&mut self, _mount: HostMount) -> bool {
        true
    }
}

pub fn format_volume(
    params: &VolumeParameters<'_>,
    target: &mut dyn Target,
    rng: &mut dyn EntropySource,
    progress: &mut dyn Progress,
    interaction: &mut dyn Interaction,
    host_fs: &mut dyn HostFilesystem,
) -> Result<FormatSummary, FormatError> {
    let hidden = params.hidden_host_size.is_some();
    let layout = VolumeLayout::compute(params.size, params.hidden_host_size, params.sector_size)?;

    log::info!(
        "formatting {} volume: {} data sectors of {} bytes, cipher {}, PRF {}",
        if hidden { "hidden" } else { "standard" },
        layout.num_sectors,
        layout.sector_size,
        params.cipher.name(),
        params.kdf.name(),
    );

    // The primary header is built once, before any I/O; a retry reuses it
    // (and never rewrites it, it is already on disk then).
    let spec = header_spec(params, &layout, false);
    let (header, mut ctx) = build_header(rng, &spec, None)?;

    let mut fs = params.filesystem;
    let mut quick = params.quick_format;
    let mut cluster_size = params.cluster_size;
    let mut instant_retry = false;
    let mut real_cluster_size = 0u32;

    loop {
        let attempt = run_attempt(
            params,
            &layout,
            &header,
            &mut ctx,
            rng,
            progress,
            interaction,
            target,
            fs,
            quick,
            cluster_size,
            instant_retry,
        );
        release_target(target, hidden, instant_retry, attempt.is_err());

        if let Some(bytes) = attempt? {
            real_cluster_size = bytes;
        }

        if !fs.host_formatted() {
            break;
        }

        let mount = host_fs.mount(params)?;
        let formatted = host_fs.format(&mount, cluster_size, fs);
        if !host_fs.unmount(mount) {
            log::warn!("could not unmount the volume after the host filesystem format");
        }
        if formatted {
            break;
        }

        // The container itself is fine, only the host format failed. Offer
        // an in-place FAT retry instead of redoing the whole format.
        let fat_fits = layout.data_area_size <= MAX_FAT_SECTOR_COUNT * layout.sector_size as u64;
        if fat_fits && interaction.confirm(Prompt::RetryWithFat) {
            log::info!("host filesystem format failed, retrying as FAT");
            fs = FilesystemKind::Fat;
            quick = true;
            cluster_size = 0;
            instant_retry = true;
            continue;
        }
        return Err(FormatError::DontReport);
    }

    Ok(FormatSummary {
        real_cluster_size,
        retried_as_fat: instant_retry,
    })
}

fn header_spec<'a>(
    params: &'a VolumeParameters<'_>,
    layout: &VolumeLayout,
    decoy: bool,
) -> HeaderSpec<'a> {
    let hidden = params.hidden_host_size.is_some();
    HeaderSpec {
        cipher: params.cipher,
        kdf: params.kdf,
        pim: params.pim,
        password: if decoy { None } else { Some(params.password) },
        data_area_size: layout.data_area_size,
        // decoys pose as hidden-volume headers
        hidden_volume_size: if hidden || decoy { layout.data_area_size } else { 0 },
        data_offset: layout.data_offset,
        flags: params.header_flags,
        sector_size: layout.sector_size,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_attempt(
    params: &VolumeParameters<'_>,
    layout: &VolumeLayout,
    header: &[u8; HEADER_EFFECTIVE_SIZE],
    ctx: &mut CryptoContext,
    rng: &mut dyn EntropySource,
    progress: &mut dyn Progress,
    interaction: &mut dyn Interaction,
    target: &mut dyn Target,
    fs: FilesystemKind,
    quick: bool,
    cluster_size: u32,
    instant_retry: bool,
) -> Result<Option<u32>, FormatError> {
    let hidden = params.hidden_host_size.is_some();

    acquire_target(target, params, layout, quick, instant_retry, interaction)?;

    if hidden {
        target.seek(layout.primary_header_offset)?;
    } else if instant_retry {
        // the header from the first pass is already on disk
        target.seek(DATA_OFFSET)?;
    }

    if !instant_retry {
        target.write_all(header)?;

        // Zero the header-group tail of standard file containers now; the
        // later random fill of that region would fragment the file.
        if !target.is_device() && !hidden {
            write_zero_bytes(target, HEADER_GROUP_SIZE - HEADER_EFFECTIVE_SIZE as u64)?;
        }
    }

    // Filling a hidden volume would be redundant: the outer volume's fill
    // already randomized its data area.
    let quick = quick || hidden;
    if hidden {
        ctx.hidden_volume_offset = Some(layout.data_offset);
    }

    let fat_params = match fs {
        FilesystemKind::Fat => Some(FatParams::compute(
            layout.num_sectors,
            layout.sector_size,
            cluster_size,
        )?),
        _ => None,
    };
    let real_cluster = fat_params.as_ref().map(|ft| ft.cluster_size * layout.sector_size);

    target.seek(layout.data_offset)?;

    if target.is_device() {
        // Device writes go through the background pipeline; it owns the
        // target for the duration of the data area.
        thread::scope(|scope| -> Result<(), FormatError> {
            let pipeline = WritePipeline::start(scope, &mut *target)?;
            let result = {
                let mut writer = SectorWriter::pipelined(
                    &pipeline,
                    layout.sector_size,
                    layout.start_sector,
                    progress,
                )?;
                write_data_area(&mut writer, ctx, rng, layout, fat_params.as_ref(), quick)
            };
            result.and(pipeline.stop())
        })?;
    } else {
        let mut writer =
            SectorWriter::direct(&mut *target, layout.sector_size, layout.start_sector, progress)?;
        write_data_area(&mut writer, ctx, rng, layout, fat_params.as_ref(), quick)?;
    }

    // Backup header: a fresh build sharing the primary's master keys. The
    // primary is durable before this runs, the backup before the decoys.
    target.flush()?;
    let backup_spec = header_spec(params, layout, false);
    let (backup, _backup_ctx) = build_header(rng, &backup_spec, Some(ctx.master_keydata()))?;
    target.seek(layout.backup_header_offset)?;
    target.write_all(&backup[..])?;

    if !hidden {
        target.flush()?;
        write_random_reserved_areas(target, rng, layout)?;

        // Decoy hidden headers in both hidden slots. Their crypto contexts
        // are dropped immediately; nobody ever holds their keys.
        let decoy_spec = header_spec(params, layout, true);
        for offset in [
            HIDDEN_HEADER_OFFSET,
            layout.backup_header_offset + HIDDEN_HEADER_OFFSET,
        ] {
            let (decoy, _decoy_ctx) = build_header(rng, &decoy_spec, None)?;
            target.seek(offset)?;
            target.write_all(&decoy[..])?;
        }
    }

    Ok(real_cluster)
}

fn write_data_area(
    writer: &mut SectorWriter<'_, '_>,
    ctx: &mut CryptoContext,
    rng: &mut dyn EntropySource,
    layout: &VolumeLayout,
    fat_params: Option<&FatParams>,
    quick: bool,
) -> Result<(), FormatError> {
    match fat_params {
        Some(ft) => crate::fat::format_fat(writer, ctx, rng, ft, quick)?,
        None => fill::fill_data_area(
            writer,
            ctx,
            rng,
            layout.num_sectors,
            layout.sector_size,
            quick,
        )?,
    }
    writer.complete(ctx)
}

fn acquire_target(
    target: &mut dyn Target,
    params: &VolumeParameters<'_>,
    layout: &VolumeLayout,
    quick: bool,
    instant_retry: bool,
    interaction: &mut dyn Interaction,
) -> Result<(), FormatError> {
    let hidden = params.hidden_host_size.is_some();

    if target.is_device() {
        let mut failed_required_dasd = false;

        if target.is_mounted() {
            if let Err(e) = target.dismount() {
                log::error!("cannot dismount the live filesystem: {}", e);
                return Err(FormatError::DontReport);
            }
            // Raw sector access past the filesystem driver; without it the
            // driver blocks writes to hidden sectors.
            if !target.allow_extended_dasd() {
                failed_required_dasd = true;
            }
        }

        let first_pass = if failed_required_dasd { 0 } else { 1 };
        for pass in first_pass..2 {
            open_device(target, params.force, interaction)?;
            let _ = target.allow_extended_dasd();

            if hidden || instant_retry {
                // a pseudo quick-format would damage the outer volume
                break;
            }

            if pass == 0 {
                // Raw access was denied: overwrite the leading filesystem
                // signature and reopen, so no driver keeps guarding the
                // device.
                let zeros = vec![0u8; 2 * SECTOR_SIZE_MAX as usize];
                target.seek(0)?;
                target.write_all(&zeros)?;
                target.flush()?;
                target.close()?;
            }
        }

        if target.is_mounted() {
            log::error!("device still reports a mounted filesystem");
            return Err(FormatError::DontReport);
        }
        target.seek(0)?;
    } else {
        target.open(&OpenRequest {
            create: !(hidden || instant_retry),
            shared: hidden || instant_retry,
        })?;

        if hidden && params.preserve_timestamps {
            target.capture_timestamps();
        }

        if !hidden && !instant_retry {
            let allocation = layout.data_area_size + HEADER_GROUP_SIZE;

            if params.sparse && quick {
                target.set_sparse()?;
            }
            target.preallocate(allocation)?;

            if quick && params.fast_create {
                if let Err(e) = target.set_valid_data_length(allocation) {
                    if !interaction.confirm(Prompt::FastCreateWithoutPrivilege) {
                        return Err(FormatError::OsError(e));
                    }
                }
            }
            target.seek(0)?;
        }
    }
    Ok(())
}

fn open_device(
    target: &mut dyn Target,
    force: bool,
    interaction: &mut dyn Interaction,
) -> Result<(), FormatError> {
    let mut last_error = None;
    for attempt in 0..EXCLUSIVE_OPEN_RETRIES {
        match target.open(&OpenRequest { create: false, shared: false }) {
            Ok(()) => return Ok(()),
            Err(e) => last_error = Some(e),
        }
        if attempt > 0 {
            thread::sleep(EXCLUSIVE_OPEN_RETRY_DELAY);
        }
    }

    // exclusive access denied, fall back to shared mode with user consent
    match target.open(&OpenRequest { create: false, shared: true }) {
        Ok(()) => {
            if !force && !interaction.confirm(Prompt::SharedModeFormat) {
                return Err(FormatError::DontReport);
            }
            Ok(())
        }
        Err(open_err) => {
            log::error!(
                "cannot access the volume device: {}",
                last_error.unwrap_or(open_err)
            );
            Err(FormatError::DontReport)
        }
    }
}

// Single release path for every attempt outcome. Never overwrites the
// in-flight error; cleanup failures are only logged.
fn release_target(target: &mut dyn Target, hidden: bool, instant_retry: bool, failed: bool) {
    if failed && !target.is_device() && !hidden && !instant_retry {
        // do not leave a partially allocated container behind
        if let Err(e) = target.truncate_to_zero() {
            log::warn!("could not truncate the failed container: {}", e);
        }
    }
    if let Err(e) = target.flush() {
        log::warn!("flush on close failed: {}", e);
    }
    target.restore_timestamps();
    if let Err(e) = target.close() {
        log::warn!("close failed: {}", e);
    }
}

fn write_zero_bytes(target: &mut dyn Target, mut remaining: u64) -> Result<(), FormatError> {
    let zeros = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        target.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

// Fill the remainder of both header groups with random data, so a header
// slot is never distinguishable by being blank. Runs after the backup
// header is durable; the decoy headers overwrite their slots afterwards.
fn write_random_reserved_areas(
    target: &mut dyn Target,
    rng: &mut dyn EntropySource,
    layout: &VolumeLayout,
) -> Result<(), FormatError> {
    let mut chunk = vec![0u8; 64 * 1024];
    for group_start in [0, layout.backup_header_offset] {
        target.seek(group_start + HEADER_EFFECTIVE_SIZE as u64)?;
        let mut remaining = HEADER_GROUP_SIZE - HEADER_EFFECTIVE_SIZE as u64;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            rng.fill(&mut chunk[..n], false)?;
            target.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
    }
    Ok(())
}
