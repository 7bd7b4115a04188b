extern crate std;


use {
    crate::*,
    core::{cell::Cell, ops::Range},
    fw_image::{
        Authenticator, HashAlgorithm, ImageFlags, ImageHeader, ImageSign, ImageStatus,
        KeyValidity, PkaFault, PublicKey, Sha2Hasher, SignatureVerify, VerificationResult,
        VersionRecord, SIGNATURE_SIZE,
    },
    host_protocol::{Command, ErrorCode, PartitionId, Request, Response, PROTOCOL_VERSION},
    std::{vec, vec::Vec},
};

static KEYS: [PublicKey; 4] = [[0x11; 512], [0x22; 512], [0x33; 512], [0x44; 512]];

/// Signature = digest followed by the first bytes of the signing key.
struct Rsa;

impl ImageSign for Rsa {
    fn sign_rsa(&self, key_selector: u32, digest: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let mut sig = [0; SIGNATURE_SIZE];
        sig[..digest.len()].copy_from_slice(digest);
        sig[digest.len()..digest.len() + 16].copy_from_slice(&KEYS[key_selector as usize][..16]);
        sig
    }
}

impl SignatureVerify for Rsa {
    fn verify_rsa(
        &self,
        modulus: &PublicKey,
        digest: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<VerificationResult, PkaFault> {
        if &signature[..digest.len()] == digest
            && signature[digest.len()..digest.len() + 16] == modulus[..16]
        {
            Ok(VerificationResult::Valid)
        } else {
            Ok(VerificationResult::Invalid)
        }
    }
}

/// Fuse bitmap of revoked keys.
struct Fuses(u8);

impl KeyValidity for Fuses {
    fn is_key_valid(&self, index: usize) -> bool {
        self.0 & (1 << index) == 0
    }
}

/// Advances a few microseconds every time it is read.
struct TickClock {
    now: Cell<u64>,
}

impl TickClock {
    fn new() -> Self {
        Self { now: Cell::new(0) }
    }
}

impl Clock for TickClock {
    fn now_us(&self) -> u64 {
        let now = self.now.get() + 5;
        self.now.set(now);
        now
    }
}

/// 8 MiB device with 4 KiB subsectors and 256 byte pages.
fn geometry() -> FlashGeometry {
    FlashGeometry {
        page_size: 256,
        pages_per_subsector: 16,
        subsectors_per_sector: 16,
        sectors: 128,
        max_page_program_us: 1_000,
        max_subsector_erase_us: 10_000,
    }
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    is_erase: bool,
    polls_left: u32,
    failed: bool,
}

/// RAM backed NOR flash. Programming can only clear bits and a subsector
/// erase sets them all again. Faults are injected through the public fields.
struct SimFlash {
    mem: Vec<u8>,
    geometry: FlashGeometry,
    pending: Option<Pending>,
    /// Busy polls before an operation completes.
    busy_polls: u32,
    /// Start address of every subsector erase, in order.
    erases: Vec<u32>,
    programs: usize,
    geometry_fault: bool,
    stuck_erase: bool,
    stuck_program: bool,
    fail_erase_at: Option<u32>,
    fail_program_at: Option<u32>,
    /// Programming this byte stores a different value.
    corrupt_program_at: Option<u32>,
    uecc: Option<Range<u32>>,
}

impl SimFlash {
    fn new() -> Self {
        let geometry = geometry();
        Self {
            mem: vec![0xFF; geometry.capacity() as usize],
            geometry,
            pending: None,
            busy_polls: 2,
            erases: Vec::new(),
            programs: 0,
            geometry_fault: false,
            stuck_erase: false,
            stuck_program: false,
            fail_erase_at: None,
            fail_program_at: None,
            corrupt_program_at: None,
            uecc: None,
        }
    }

    fn place(&mut self, address: u32, bytes: &[u8]) {
        let at = address as usize;
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn bytes(&self, address: u32, len: usize) -> &[u8] {
        &self.mem[address as usize..address as usize + len]
    }

    /// Erases that started inside `range`.
    fn erases_in(&self, range: Range<u32>) -> usize {
        self.erases.iter().filter(|a| range.contains(a)).count()
    }

    fn start(&mut self, is_erase: bool, failed: bool) -> Result<(), DeviceFault> {
        // Starting while an operation is in flight means two sequences overlap.
        if self.pending.is_some() {
            return Err(DeviceFault::Bus);
        }
        self.pending = Some(Pending {
            is_erase,
            polls_left: self.busy_polls,
            failed,
        });
        Ok(())
    }
}

impl SpiNorFlash for SimFlash {
    fn geometry(&mut self) -> Result<FlashGeometry, DeviceFault> {
        if self.geometry_fault {
            return Err(DeviceFault::Bus);
        }
        Ok(self.geometry)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), DeviceFault> {
        if self.pending.is_some() {
            return Err(DeviceFault::Bus);
        }
        let end = address + buf.len() as u32;
        if let Some(bad) = &self.uecc {
            if address < bad.end && bad.start < end {
                return Err(DeviceFault::Uecc);
            }
        }
        buf.copy_from_slice(self.bytes(address, buf.len()));
        Ok(())
    }

    fn start_subsector_erase(&mut self, address: u32) -> Result<(), DeviceFault> {
        let ss = self.geometry.subsector_size();
        if address % ss != 0 || address >= self.geometry.capacity() {
            return Err(DeviceFault::Bus);
        }
        let failed = self.fail_erase_at == Some(address);
        self.start(true, failed)?;
        self.erases.push(address);
        if !failed {
            self.mem[address as usize..(address + ss) as usize].fill(0xFF);
        }
        Ok(())
    }

    fn start_page_program(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceFault> {
        let page = self.geometry.page_size;
        let end = address + data.len() as u32;
        if data.is_empty() || address / page != (end - 1) / page {
            return Err(DeviceFault::Bus);
        }
        let failed = self.fail_program_at.is_some_and(|a| (address..end).contains(&a));
        self.start(false, failed)?;
        self.programs += 1;
        for (i, &byte) in data.iter().enumerate() {
            let at = address + i as u32;
            let cell = &mut self.mem[at as usize];
            *cell &= byte;
            if self.corrupt_program_at == Some(at) {
                *cell ^= 0x01;
            }
        }
        Ok(())
    }

    fn status(&mut self) -> Result<DeviceStatus, DeviceFault> {
        let Some(mut op) = self.pending else {
            return Ok(DeviceStatus::Ready);
        };
        let stuck = if op.is_erase {
            self.stuck_erase
        } else {
            self.stuck_program
        };
        if stuck {
            return Ok(DeviceStatus::Busy);
        }
        if op.polls_left > 0 {
            op.polls_left -= 1;
            self.pending = Some(op);
            return Ok(DeviceStatus::Busy);
        }
        self.pending = None;
        Ok(if op.failed {
            DeviceStatus::Failed
        } else {
            DeviceStatus::Ready
        })
    }
}

fn new_engine(sim: SimFlash) -> Engine<SimFlash, TickClock> {
    Engine::new(sim, TickClock::new()).unwrap()
}

fn authenticator() -> Authenticator<'static, Sha2Hasher, Rsa, Fuses> {
    Authenticator::new(&KEYS, Sha2Hasher::new(), Rsa, Fuses(0), true)
}

type Context = FlashUpdateContext<'static, SimFlash, TickClock, Sha2Hasher, Rsa, Fuses>;

fn boot(sim: SimFlash, handoff: BootHandoff) -> Context {
    boot_with(sim, PartitionLayout::DEFAULT, handoff)
}

fn boot_with(sim: SimFlash, layout: PartitionLayout, handoff: BootHandoff) -> Context {
    FlashUpdateContext::init(sim, TickClock::new(), authenticator(), layout, "1.2.0-test", &handoff)
        .unwrap()
}

/// Both copies authenticated, A selected.
fn booted_from_a() -> BootHandoff {
    BootHandoff::new(PartitionId::A, ImageStatus::Success, ImageStatus::Success)
}

/// A body of `len` bytes whose last bytes are a version record.
fn body(len: usize, build_number: u32) -> Vec<u8> {
    let mut body: Vec<u8> = (0..len).map(|i| (i * 13 + i / 509) as u8).collect();
    let record = VersionRecord {
        major: 1,
        minor: 2,
        build_patch: 0,
        build_number,
        build_date: 10_18_2026,
    };
    body[len - VersionRecord::SIZE..].copy_from_slice(&record.to_bytes());
    body
}

/// Header and body of a signed image.
fn image(len: usize, key_selector: u32, build_number: u32) -> Vec<u8> {
    let body = body(len, build_number);
    let header = ImageHeader::seal(
        &body,
        key_selector,
        HashAlgorithm::Sha256,
        ImageFlags::empty(),
        &mut Sha2Hasher::new(),
        &Rsa,
    )
    .unwrap();
    let mut bytes = vec![0u8; ImageHeader::SIZE];
    header.serialize(&mut bytes).unwrap();
    bytes.extend_from_slice(&body);
    bytes
}

/// Device holding `image` in both partitions and A selected.
fn mirrored(image: &[u8]) -> SimFlash {
    let layout = PartitionLayout::DEFAULT;
    let mut sim = SimFlash::new();
    sim.place(layout.image(PartitionId::A).header, image);
    sim.place(layout.image(PartitionId::B).header, image);
    sim.place(layout.active_flag.start, &[0]);
    sim
}

fn request(context: &mut Context, command: Command<'_>) -> Response {
    let mut buf = [0u8; host_protocol::MAX_MSG_SIZE];
    let encoded = Request::new(command).encode(&mut buf).unwrap();
    context.handle(encoded)
}

fn stage(context: &mut Context, partition: PartitionId, image: &[u8]) {
    for (sequence, page) in image.chunks(consts::FLASH_LOADER_PAGE_BUF_SIZE).enumerate() {
        let response = request(
            context,
            Command::Write {
                partition,
                sequence: sequence as u32,
                page,
            },
        );
        assert!(response.is_success(), "page {sequence}: {:?}", response.error_code());
    }
}
