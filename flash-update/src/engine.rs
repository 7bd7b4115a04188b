// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subsector-safe erase/program engine.
//!
//! The device only erases whole subsectors. [`Engine::erase`] erases an
//! arbitrary byte range by saving the bytes of a partially covered subsector
//! that lie outside the range, erasing it and programming them back.
//! Every erase and program is started and polled to completion inside a
//! critical section, and the poll is bounded by the device's worst case time.

use {
    crate::device::{Clock, DeviceFault, DeviceStatus, FlashGeometry, SpiNorFlash},
    consts::MAX_SUBSECTOR_SIZE,
    embedded_storage::{ReadStorage, Storage},
    fw_image::{ImageSource, ReadFault},
};

/// Erase/program engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The geometry query failed or describes an unsupported device.
    Geometry,
    OutOfBounds { address: u32, len: u32 },
    /// Source and destination of a copy overlap.
    Overlap,
    Read { address: u32 },
    Erase { address: u32 },
    EraseTimeout { address: u32 },
    Program { address: u32 },
    ProgramTimeout { address: u32 },
    /// Uncorrectable ECC error reported by the device.
    Uecc { address: u32 },
}

impl FlashError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::EraseTimeout { .. } | Self::ProgramTimeout { .. })
    }

    /// Address the failure was reported at, if any.
    pub fn address(&self) -> Option<u32> {
        match *self {
            Self::OutOfBounds { address, .. }
            | Self::Read { address }
            | Self::Erase { address }
            | Self::EraseTimeout { address }
            | Self::Program { address }
            | Self::ProgramTimeout { address }
            | Self::Uecc { address } => Some(address),
            Self::Geometry | Self::Overlap => None,
        }
    }
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Geometry => write!(f, "flash geometry unavailable or unsupported"),
            Self::OutOfBounds { address, len } => {
                write!(f, "range {address:#x}+{len:#x} outside flash")
            }
            Self::Overlap => write!(f, "copy source and destination overlap"),
            Self::Read { address } => write!(f, "read failed at {address:#x}"),
            Self::Erase { address } => write!(f, "subsector erase failed at {address:#x}"),
            Self::EraseTimeout { address } => {
                write!(f, "subsector erase timed out at {address:#x}")
            }
            Self::Program { address } => write!(f, "page program failed at {address:#x}"),
            Self::ProgramTimeout { address } => {
                write!(f, "page program timed out at {address:#x}")
            }
            Self::Uecc { address } => write!(f, "uncorrectable ECC error at {address:#x}"),
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Erase,
    Program,
}

/// Device plus the timing needed to drive it.
struct Nor<D, C> {
    device: D,
    clock: C,
    geometry: FlashGeometry,
    uecc_seen: bool,
}

impl<D: SpiNorFlash, C: Clock> Nor<D, C> {
    /// End of `[address, address + len)`, if it lies on the device.
    fn check_range(&self, address: u32, len: u32) -> Result<u32, FlashError> {
        address
            .checked_add(len)
            .filter(|&end| end <= self.geometry.capacity())
            .ok_or(FlashError::OutOfBounds { address, len })
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        match self.device.read(address, buf) {
            Ok(()) => Ok(()),
            Err(DeviceFault::Uecc) => {
                self.uecc_seen = true;
                Err(FlashError::Uecc { address })
            }
            Err(DeviceFault::Bus) => Err(FlashError::Read { address }),
        }
    }

    fn erase_subsector(&mut self, address: u32) -> Result<(), FlashError> {
        self.execute(Op::Erase, address, &[])
    }

    /// Program `data` at `address`, split on page boundaries.
    /// Pages that would only program `0xFF` are skipped.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let page = self.geometry.page_size;
        let mut offset = 0;
        while offset < data.len() {
            let at = address + offset as u32;
            let len = ((page - at % page) as usize).min(data.len() - offset);
            let chunk = &data[offset..offset + len];
            if chunk.iter().any(|&b| b != 0xFF) {
                self.execute(Op::Program, at, chunk)?;
            }
            offset += len;
        }
        Ok(())
    }

    /// Start one operation and spin until it completes or its time runs out.
    fn execute(&mut self, op: Op, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let (timeout, failed, timed_out) = match op {
            Op::Erase => (
                self.geometry.max_subsector_erase_us,
                FlashError::Erase { address },
                FlashError::EraseTimeout { address },
            ),
            Op::Program => (
                self.geometry.max_page_program_us,
                FlashError::Program { address },
                FlashError::ProgramTimeout { address },
            ),
        };
        let device = &mut self.device;
        let clock = &self.clock;

        let result = critical_section::with(|_| {
            let started = match op {
                Op::Erase => device.start_subsector_erase(address),
                Op::Program => device.start_page_program(address, data),
            };
            match started {
                Ok(()) => {}
                Err(DeviceFault::Uecc) => return Err(FlashError::Uecc { address }),
                Err(DeviceFault::Bus) => return Err(failed),
            }

            let start = clock.now_us();
            loop {
                match device.status() {
                    Ok(DeviceStatus::Ready) => return Ok(()),
                    Ok(DeviceStatus::Busy) => {}
                    Ok(DeviceStatus::Failed) | Err(DeviceFault::Bus) => return Err(failed),
                    Ok(DeviceStatus::Uecc) | Err(DeviceFault::Uecc) => {
                        return Err(FlashError::Uecc { address })
                    }
                }
                // A timed out erase may have left the subsector half erased;
                // the caller has to abort rather than retry.
                if clock.now_us().saturating_sub(start) > u64::from(timeout) {
                    return Err(timed_out);
                }
            }
        });

        if let Err(e) = result {
            if matches!(e, FlashError::Uecc { .. }) {
                self.uecc_seen = true;
            }
            log_error!("flash operation failed: {:?}", e);
        }
        result
    }
}

/// Erase/program engine with its subsector buffer.
pub struct Engine<D, C> {
    nor: Nor<D, C>,
    buf: [u8; MAX_SUBSECTOR_SIZE],
}

impl<D: SpiNorFlash, C: Clock> Engine<D, C> {
    /// Query the geometry once and take ownership of the device.
    pub fn new(mut device: D, clock: C) -> Result<Self, FlashError> {
        let geometry = device.geometry().map_err(|_| FlashError::Geometry)?;
        geometry.validate()?;
        log_info!(
            "flash: {} bytes, {} byte subsectors, {} byte pages",
            geometry.capacity(),
            geometry.subsector_size(),
            geometry.page_size
        );
        Ok(Self {
            nor: Nor {
                device,
                clock,
                geometry,
                uecc_seen: false,
            },
            buf: [0xFF; MAX_SUBSECTOR_SIZE],
        })
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.nor.geometry
    }

    pub fn device(&self) -> &D {
        &self.nor.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.nor.device
    }

    /// Returns whether an uncorrectable ECC error was reported since the last
    /// call, and clears the flag.
    pub fn take_uecc(&mut self) -> bool {
        core::mem::take(&mut self.nor.uecc_seen)
    }

    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.nor.check_range(address, buf.len() as u32)?;
        self.nor.read(address, buf)
    }

    /// Program already erased flash.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.nor.check_range(address, data.len() as u32)?;
        self.nor.program(address, data)
    }

    /// Erase exactly `[start, start + len)`.
    ///
    /// Bytes outside the range that share a subsector with it are preserved.
    pub fn erase(&mut self, start: u32, len: u32) -> Result<(), FlashError> {
        if len == 0 {
            return Ok(());
        }
        let end = self.nor.check_range(start, len)?;
        let ss = self.nor.geometry.subsector_size();

        let mut base = start - start % ss;
        while base < end {
            let sub_end = base + ss;
            let keep_head = (start.max(base) - base) as usize;
            let keep_tail = (sub_end - end.min(sub_end)) as usize;

            if keep_head == 0 && keep_tail == 0 {
                self.nor.erase_subsector(base)?;
            } else {
                log_debug!(
                    "partial erase of subsector {:#x}: keeping {} + {} bytes",
                    base,
                    keep_head,
                    keep_tail
                );
                let sub = ss as usize;
                let buf = &mut self.buf[..sub];
                self.nor.read(base, buf)?;
                self.nor.erase_subsector(base)?;
                self.nor.program(base, &buf[..keep_head])?;
                let tail_from = sub - keep_tail;
                self.nor.program(base + tail_from as u32, &buf[tail_from..])?;
            }
            base = sub_end;
        }
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dst` through the subsector buffer.
    ///
    /// `[dst, dst + len)` must already be erased.
    pub fn copy(&mut self, src: u32, dst: u32, len: u32) -> Result<(), FlashError> {
        let src_end = self.nor.check_range(src, len)?;
        let dst_end = self.nor.check_range(dst, len)?;
        if len != 0 && src < dst_end && dst < src_end {
            return Err(FlashError::Overlap);
        }

        let ss = self.nor.geometry.subsector_size();
        let mut offset = 0;
        while offset < len {
            let from = src + offset;
            let chunk = (ss - from % ss).min(len - offset) as usize;
            self.nor.read(from, &mut self.buf[..chunk])?;
            self.nor.program(dst + offset, &self.buf[..chunk])?;
            offset += chunk as u32;
        }
        Ok(())
    }

    /// Compare two ranges. Returns the address in `a` of the first byte that
    /// differs, or `None` if the ranges are identical.
    pub fn compare(&mut self, a: u32, b: u32, len: u32) -> Result<Option<u32>, FlashError> {
        self.nor.check_range(a, len)?;
        self.nor.check_range(b, len)?;

        let half = MAX_SUBSECTOR_SIZE / 2;
        let (left, right) = self.buf.split_at_mut(half);
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(half as u32) as usize;
            self.nor.read(a + offset, &mut left[..chunk])?;
            self.nor.read(b + offset, &mut right[..chunk])?;
            if let Some(pos) = left[..chunk].iter().zip(&right[..chunk]).position(|(x, y)| x != y) {
                return Ok(Some(a + offset + pos as u32));
            }
            offset += chunk as u32;
        }
        Ok(None)
    }

    /// Overwrite `data` at `address` keeping every other byte.
    ///
    /// Each touched subsector is read into the buffer, patched, erased and
    /// programmed back. Subsectors that already hold `data` are left alone.
    pub fn rewrite(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let end = self.nor.check_range(address, data.len() as u32)?;
        let ss = self.nor.geometry.subsector_size();
        let sub = ss as usize;

        let mut base = address - address % ss;
        while base < end {
            let from = address.max(base);
            let to = end.min(base + ss);
            let patch = &data[(from - address) as usize..(to - address) as usize];
            let at = (from - base) as usize;

            let buf = &mut self.buf[..sub];
            self.nor.read(base, buf)?;
            if &buf[at..at + patch.len()] != patch {
                buf[at..at + patch.len()].copy_from_slice(patch);
                self.nor.erase_subsector(base)?;
                self.nor.program(base, buf)?;
            }
            base += ss;
        }
        Ok(())
    }
}

impl<D: SpiNorFlash, C: Clock> ReadStorage for Engine<D, C> {
    type Error = FlashError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        Engine::read(self, offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.nor.geometry.capacity() as usize
    }
}

impl<D: SpiNorFlash, C: Clock> Storage for Engine<D, C> {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.rewrite(offset, bytes)
    }
}

impl<D: SpiNorFlash, C: Clock> ImageSource for Engine<D, C> {
    fn read_image(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ReadFault> {
        Engine::read(self, address, buf).map_err(|_| ReadFault)
    }

    fn is_image_memory(&self, address: u32, len: u32) -> bool {
        self.nor.check_range(address, len).is_ok()
    }
}
