extern crate std;

use {super::*, core::cell::Cell, std::vec, std::vec::Vec};

const KEYS: [PublicKey; 4] = [[0x11; 512], [0x22; 512], [0x33; 512], [0x44; 512]];
const BASE: u32 = 0x1000;

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

struct BrokenPka;

impl SignatureVerify for BrokenPka {
    fn verify_rsa(
        &self,
        _modulus: &PublicKey,
        _digest: &[u8],
        _signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<VerificationResult, PkaFault> {
        Err(PkaFault)
    }
}

/// Fuse bitmap of revoked keys.
struct Fuses(u8);

impl KeyValidity for Fuses {
    fn is_key_valid(&self, index: usize) -> bool {
        self.0 & (1 << index) == 0
    }
}

/// Counts how many digests were started.
struct CountingHasher<'a> {
    inner: Sha2Hasher,
    started: &'a Cell<usize>,
}

impl ImageHasher for CountingHasher<'_> {
    fn start(&mut self, algorithm: HashAlgorithm) -> Result<(), HashError> {
        self.started.set(self.started.get() + 1);
        self.inner.start(algorithm)
    }

    fn update(&mut self, data: &[u8]) -> Result<(), HashError> {
        self.inner.update(data)
    }

    fn finish(&mut self) -> Result<Digest, HashError> {
        self.inner.finish()
    }
}

/// Hash engine that faults on one `update` call or truncates its digest.
struct FaultyHasher {
    inner: Sha2Hasher,
    updates: usize,
    fail_update: Option<usize>,
    digest_len: Option<usize>,
}

impl FaultyHasher {
    fn new() -> Self {
        Self {
            inner: Sha2Hasher::new(),
            updates: 0,
            fail_update: None,
            digest_len: None,
        }
    }
}

impl ImageHasher for FaultyHasher {
    fn start(&mut self, algorithm: HashAlgorithm) -> Result<(), HashError> {
        self.updates = 0;
        self.inner.start(algorithm)
    }

    fn update(&mut self, data: &[u8]) -> Result<(), HashError> {
        self.updates += 1;
        if self.fail_update == Some(self.updates) {
            return Err(HashError::Engine);
        }
        self.inner.update(data)
    }

    fn finish(&mut self) -> Result<Digest, HashError> {
        let digest = self.inner.finish()?;
        match self.digest_len {
            Some(len) => Digest::from_slice(&digest.as_bytes()[..len]).ok_or(HashError::Engine),
            None => Ok(digest),
        }
    }
}

/// Memory mapped at [`BASE`], optionally failing reads at one address.
struct Memory {
    bytes: Vec<u8>,
    bad_address: Option<u32>,
}

impl Memory {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            bad_address: None,
        }
    }
}

impl ImageSource for Memory {
    fn read_image(&mut self, address: u32, buf: &mut [u8]) -> Result<(), ReadFault> {
        let end = address + buf.len() as u32;
        if let Some(bad) = self.bad_address {
            if (address..end).contains(&bad) {
                return Err(ReadFault);
            }
        }
        let start = (address - BASE) as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn is_image_memory(&self, address: u32, len: u32) -> bool {
        address >= BASE && (address - BASE + len) as usize <= self.bytes.len()
    }
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

fn image(body: &[u8], key_selector: u32, algorithm: HashAlgorithm) -> Vec<u8> {
    let header = ImageHeader::seal(
        body,
        key_selector,
        algorithm,
        ImageFlags::empty(),
        &mut Sha2Hasher::new(),
        &Rsa,
    )
    .unwrap();
    let mut bytes = vec![0u8; ImageHeader::SIZE];
    header.serialize(&mut bytes).unwrap();
    bytes.extend_from_slice(body);
    bytes
}

/// Recompute the context CRC after patching a field.
fn fix_crc(image: &mut [u8]) {
    let context = &mut image[ImageHeader::CONTEXT_OFFSET..ImageHeader::CONTEXT_OFFSET + ContextBlock::SIZE];
    let crc = CONTEXT_CRC.checksum(&context[..ContextBlock::CRC_OFFSET]);
    context[ContextBlock::CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
}

fn patch_word(image: &mut [u8], context_offset: usize, value: u32) {
    let at = ImageHeader::CONTEXT_OFFSET + context_offset;
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
    fix_crc(image);
}

fn authenticator(secure_boot: bool) -> Authenticator<'static, Sha2Hasher, Rsa, Fuses> {
    Authenticator::new(&KEYS, Sha2Hasher::new(), Rsa, Fuses(0), secure_boot)
}

fn check(bytes: Vec<u8>, secure_boot: bool) -> ImageDescriptor {
    authenticator(secure_boot).authenticate_image(&mut Memory::new(bytes), BASE, ImageId::A, 0x10_0000)
}

#[test]
fn header_layout() {
    let bytes = image(&body(300), 2, HashAlgorithm::Sha256);
    let header = ImageHeader::parse_unverified(&bytes).unwrap();

    assert_eq!(AuthBlock::SIZE, 640);
    assert_eq!(ImageHeader::CONTEXT_OFFSET + ContextBlock::SIZE, ImageHeader::SIZE);
    assert_eq!(&bytes[640..644], &300u32.to_le_bytes());
    assert_eq!(&bytes[644..648], &2u32.to_le_bytes());
    assert_eq!(&bytes[648..652], &2u32.to_le_bytes());
    assert_eq!(&bytes[2044..2048], &header.context().crc().to_le_bytes());

    assert_eq!(header.fw_length(), 300);
    assert_eq!(header.image_length(), 2348);
    assert_eq!(header.context().key_selector(), 2);
    assert_eq!(header.context().hash_algorithm(), Some(HashAlgorithm::Sha256));
    assert_eq!(header.context().next_stage_keys(), [None, None]);

    // A 32 byte digest is zero padded to the full fingerprint.
    assert!(header.auth().fingerprint()[32..].iter().all(|&b| b == 0));
    assert!(header.auth().fingerprint()[..32].iter().any(|&b| b != 0));
}

#[test]
fn flags_and_next_stage_keys() {
    let next = [0x5Au8; 512];
    let context = ContextBlock::new(
        64,
        1,
        HashAlgorithm::Sha512,
        ImageFlags::COMPRESSED | ImageFlags::RAW_ELF,
        7,
        [None, Some(&next)],
    );
    let mut raw = [0u8; ContextBlock::SIZE];
    context.serialize(&mut raw).unwrap();
    assert_eq!(&raw[12..24], &[1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0]);

    let parsed = ContextBlock::parse(&raw).unwrap();
    assert_eq!(parsed, context);
    assert_eq!(parsed.flags(), ImageFlags::COMPRESSED | ImageFlags::RAW_ELF);
    assert_eq!(parsed.loader_version(), 7);
    assert_eq!(parsed.next_stage_keys(), [None, Some(&next)]);
}

#[test]
fn context_crc_mismatch_is_detected() {
    let mut raw = [0u8; ContextBlock::SIZE];
    ContextBlock::new(64, 0, HashAlgorithm::Sha256, ImageFlags::empty(), 0, [None; 2])
        .serialize(&mut raw)
        .unwrap();
    raw[0] ^= 1;
    assert!(matches!(
        ContextBlock::parse(&raw),
        Err(Error::ContextCrcMismatch { .. })
    ));
    assert_eq!(ContextBlock::parse(&raw[..100]), Err(Error::HeaderTooShort));
}

#[test]
fn valid_image_authenticates() {
    for algorithm in [
        HashAlgorithm::Sha224,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ] {
        let image = check(image(&body(5000), 2, algorithm), true);
        assert_eq!(image.status, ImageStatus::Success, "{algorithm:?}");
        assert_eq!(image.extended_error, 0);
    }
}

#[test]
fn flipped_signature_byte_fails_with_secure_boot() {
    let mut bytes = image(&body(4096), 0, HashAlgorithm::Sha256);
    bytes[FINGERPRINT_SIZE + 3] ^= 0x80;
    assert_eq!(check(bytes.clone(), true).status, ImageStatus::InvalidSignature);

    // Without secure boot the signature is waived but the fingerprint still holds.
    assert_eq!(check(bytes, false).status, ImageStatus::Success);
}

#[test]
fn modified_body_never_succeeds() {
    let mut bytes = image(&body(4096), 1, HashAlgorithm::Sha256);
    bytes[ImageHeader::SIZE + 100] ^= 1;
    assert_eq!(check(bytes.clone(), true).status, ImageStatus::InvalidSignature);
    assert_eq!(check(bytes, false).status, ImageStatus::InvalidHash);
}

#[test]
fn fingerprint_mismatch_is_invalid_hash() {
    let mut bytes = image(&body(100), 1, HashAlgorithm::Sha256);
    // Only the padding of the fingerprint changes; the signature still verifies.
    bytes[100] = 0xFF;
    assert_eq!(check(bytes, true).status, ImageStatus::InvalidHash);
}

#[test]
fn corrupted_context_is_context_dma() {
    let mut bytes = image(&body(100), 1, HashAlgorithm::Sha256);
    bytes[ImageHeader::CONTEXT_OFFSET + 200] ^= 0x01;
    assert_eq!(check(bytes, false).status, ImageStatus::ContextDma);
}

#[test]
fn oversized_length_rejected_before_hashing() {
    let mut bytes = image(&body(100), 1, HashAlgorithm::Sha256);
    patch_word(&mut bytes, 0, 0x10_0001);
    let started = Cell::new(0);
    let hasher = CountingHasher {
        inner: Sha2Hasher::new(),
        started: &started,
    };
    let mut auth = Authenticator::new(&KEYS, hasher, Rsa, Fuses(0), true);
    let image = auth.authenticate_image(&mut Memory::new(bytes), BASE, ImageId::Upgrade, 0x10_0000);
    assert_eq!(image.status, ImageStatus::InvalidLength);
    assert_eq!(image.extended_error, 0x10_0001);
    assert_eq!(started.get(), 0);
}

#[test]
fn zero_length_is_invalid() {
    let mut bytes = image(&body(100), 1, HashAlgorithm::Sha256);
    patch_word(&mut bytes, 0, 0);
    assert_eq!(check(bytes, true).status, ImageStatus::InvalidLength);
}

#[test]
fn length_past_memory_is_invalid_mem_type() {
    let mut bytes = image(&body(100), 1, HashAlgorithm::Sha256);
    patch_word(&mut bytes, 0, 200);
    assert_eq!(check(bytes, true).status, ImageStatus::InvalidMemType);
    assert_eq!(
        authenticator(true)
            .authenticate_image(&mut Memory::new(vec![0; 16]), BASE, ImageId::A, 100)
            .status,
        ImageStatus::InvalidMemType
    );
}

#[test]
fn key_index_out_of_table() {
    let mut bytes = image(&body(100), 1, HashAlgorithm::Sha256);
    patch_word(&mut bytes, 4, 4);
    let image = check(bytes, true);
    assert_eq!(image.status, ImageStatus::InvalidKeyIndex);
    assert_eq!(image.extended_error, 4);
}

#[test]
fn revoked_key() {
    let bytes = image(&body(100), 2, HashAlgorithm::Sha256);
    let mut auth = Authenticator::new(&KEYS, Sha2Hasher::new(), Rsa, Fuses(1 << 2), true);
    let image = auth.authenticate_image(&mut Memory::new(bytes), BASE, ImageId::B, 0x10_0000);
    assert_eq!(image.status, ImageStatus::KeyRevoked);
}

#[test]
fn signature_under_other_key_fails() {
    let mut bytes = image(&body(100), 2, HashAlgorithm::Sha256);
    patch_word(&mut bytes, 4, 3);
    assert_eq!(check(bytes, true).status, ImageStatus::InvalidSignature);
}

#[test]
fn unknown_and_unsupported_hash_algorithms() {
    let mut bytes = image(&body(100), 0, HashAlgorithm::Sha256);
    patch_word(&mut bytes, 8, 9);
    assert_eq!(check(bytes.clone(), true).status, ImageStatus::InvalidHashAlgo);

    patch_word(&mut bytes, 8, HashAlgorithm::Sha3_512 as u32);
    assert_eq!(check(bytes, true).status, ImageStatus::InvalidHashAlgo);
}

#[test]
fn transfer_failures_by_stage() {
    let bytes = image(&body(3000), 0, HashAlgorithm::Sha256);
    let cases = [
        (BASE + 10, ImageStatus::ImageAuthDma),
        (BASE + 700, ImageStatus::ContextDma),
        (BASE + 2048 + 2500, ImageStatus::ImageDma),
    ];
    for (bad, status) in cases {
        let mut memory = Memory::new(bytes.clone());
        memory.bad_address = Some(bad);
        let image = authenticator(true).authenticate_image(&mut memory, BASE, ImageId::A, 0x10_0000);
        assert_eq!(image.status, status);
    }
}

#[test]
fn pka_fault() {
    let bytes = image(&body(100), 0, HashAlgorithm::Sha256);
    let mut auth = Authenticator::new(&KEYS, Sha2Hasher::new(), BrokenPka, Fuses(0), false);
    let image = auth.authenticate_image(&mut Memory::new(bytes), BASE, ImageId::A, 0x10_0000);
    assert_eq!(image.status, ImageStatus::PkaError);
}

#[test]
fn hash_engine_faults_are_sha_errors() {
    let bytes = image(&body(5000), 0, HashAlgorithm::Sha256);

    // The context block is the first update, body chunks follow.
    for secure_boot in [true, false] {
        let mut hasher = FaultyHasher::new();
        hasher.fail_update = Some(3);
        let mut auth = Authenticator::new(&KEYS, hasher, Rsa, Fuses(0), secure_boot);
        let image = auth.authenticate_image(&mut Memory::new(bytes.clone()), BASE, ImageId::A, 0x10_0000);
        assert_eq!(image.status, ImageStatus::ShaError);
        assert_eq!(image.extended_error, 0);
        assert!(!image.status.is_success());
    }

    let mut hasher = FaultyHasher::new();
    hasher.digest_len = Some(20);
    let mut auth = Authenticator::new(&KEYS, hasher, Rsa, Fuses(0), false);
    let image = auth.authenticate_image(&mut Memory::new(bytes.clone()), BASE, ImageId::A, 0x10_0000);
    assert_eq!(image.status, ImageStatus::ShaError);
    assert_eq!(image.extended_error, 20);

    // The same engine without faults accepts the image.
    let mut auth = Authenticator::new(&KEYS, FaultyHasher::new(), Rsa, Fuses(0), true);
    let image = auth.authenticate_image(&mut Memory::new(bytes), BASE, ImageId::A, 0x10_0000);
    assert_eq!(image.status, ImageStatus::Success);
}

#[test]
fn list_stops_at_first_success() {
    let good = image(&body(512), 0, HashAlgorithm::Sha256);
    let mut bytes = good.clone();
    bytes[ImageHeader::SIZE] ^= 0xFF;
    let second = bytes.len() as u32;
    bytes.extend_from_slice(&good);
    bytes.extend_from_slice(&good);
    let third = second * 2;

    let mut images = [
        ImageDescriptor::new(BASE, ImageId::A),
        ImageDescriptor::new(BASE + second, ImageId::B),
        ImageDescriptor::new(BASE + third, ImageId::Upgrade),
    ];
    let found = authenticator(true).authenticate(&mut Memory::new(bytes), &mut images, 0x10_0000);
    assert_eq!(found, Some(1));
    assert_eq!(images[0].status, ImageStatus::InvalidSignature);
    assert_eq!(images[1].status, ImageStatus::Success);
    assert_eq!(images[2].status, ImageStatus::NotTested);
}

#[test]
fn version_record_at_body_tail() {
    let record = VersionRecord {
        major: 3,
        minor: 1,
        build_patch: 4,
        build_number: 1592,
        build_date: 10_18_2026,
    };
    let mut payload = body(1000);
    payload[980..].copy_from_slice(&record.to_bytes());
    let mut memory = Memory::new(image(&payload, 0, HashAlgorithm::Sha256));

    assert_eq!(VersionRecord::read(&mut memory, BASE, 1000, 0x10_0000), record);
    assert_eq!(
        VersionRecord::read(&mut memory, BASE, 0x10_0001, 0x10_0000),
        VersionRecord::ERASED
    );
    assert_eq!(VersionRecord::read(&mut memory, BASE, 19, 0x10_0000), VersionRecord::ERASED);
    // Past the end of readable memory.
    assert_eq!(VersionRecord::read(&mut memory, BASE, 5000, 0x10_0000), VersionRecord::ERASED);
}

#[test]
fn sha2_hasher_misuse() {
    let mut hasher = Sha2Hasher::new();
    assert_eq!(hasher.update(b"abc"), Err(HashError::Engine));
    assert_eq!(hasher.finish(), Err(HashError::Engine));
    assert_eq!(hasher.start(HashAlgorithm::Sha1), Err(HashError::Unsupported));

    hasher.start(HashAlgorithm::Sha256).unwrap();
    hasher.update(b"abc").unwrap();
    let digest = hasher.finish().unwrap();
    assert_eq!(
        &digest.as_bytes()[..4],
        &[0xba, 0x78, 0x16, 0xbf],
        "SHA-256(\"abc\")"
    );
}
