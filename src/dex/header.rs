/* The fixed 0x70-byte DEX header */

use adler::adler32_slice;
use sha1::{Digest, Sha1};

use crate::dex::error::DexError;
use crate::dex::{read_u4, read_x, write_u4, write_x};

pub const HEADER_SIZE: u32 = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const REVERSE_ENDIAN_CONSTANT: u32 = 0x7856_3412;

const MAGIC_PREFIX: [u8; 4] = [0x64, 0x65, 0x78, 0x0a];

/// The container versions this crate reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DexVersion {
    V035,
    V037,
}

impl DexVersion {
    pub fn magic(self) -> [u8; 8] {
        let digits = match self {
            DexVersion::V035 => b"035",
            DexVersion::V037 => b"037",
        };
        [MAGIC_PREFIX[0], MAGIC_PREFIX[1], MAGIC_PREFIX[2], MAGIC_PREFIX[3], digits[0], digits[1], digits[2], 0]
    }

    /// Numeric version as the runtime reports it, e.g. 35.
    pub fn number(self) -> u32 {
        match self {
            DexVersion::V035 => 35,
            DexVersion::V037 => 37,
        }
    }

    fn from_magic(magic: &[u8; 8], allow_v37: bool) -> Result<DexVersion, DexError> {
        if magic[..4] != MAGIC_PREFIX || magic[7] != 0 {
            fail!("Invalid magic value {:02x?}", magic);
        }
        match &magic[4..7] {
            b"035" => Ok(DexVersion::V035),
            b"037" if allow_v37 => Ok(DexVersion::V037),
            b"037" => fail!("DEX version 037 is not enabled"),
            other => fail!("Unsupported DEX version {:?}", String::from_utf8_lossy(other)),
        }
    }
}

/// A (count, offset) pair from the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Section {
    pub size: u32,
    pub off: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexHeader {
    pub version: DexVersion,
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link: Section,
    pub map_off: u32,
    pub string_ids: Section,
    pub type_ids: Section,
    pub proto_ids: Section,
    pub field_ids: Section,
    pub method_ids: Section,
    pub class_defs: Section,
    pub data: Section,
}

impl DexHeader {
    /// Parses and validates the header of a complete file image.
    pub fn read(bytes: &[u8], allow_v37: bool) -> Result<DexHeader, DexError> {
        if bytes.len() < HEADER_SIZE as usize {
            fail!("Not enough bytes for header: {}", bytes.len());
        }
        let mut ix = 0;
        let mut magic = [0u8; 8];
        magic.copy_from_slice(read_x(bytes, &mut ix, 8)?);
        let version = DexVersion::from_magic(&magic, allow_v37)?;
        let checksum = read_u4(bytes, &mut ix)?;
        let mut signature = [0u8; 20];
        signature.copy_from_slice(read_x(bytes, &mut ix, 20)?);
        let section = |ix: &mut usize| -> Result<Section, DexError> {
            Ok(Section { size: read_u4(bytes, ix)?, off: read_u4(bytes, ix)? })
        };
        let file_size = read_u4(bytes, &mut ix)?;
        let header_size = read_u4(bytes, &mut ix)?;
        let endian_tag = read_u4(bytes, &mut ix)?;
        let link = section(&mut ix)?;
        let map_off = read_u4(bytes, &mut ix)?;
        let header = DexHeader {
            version,
            checksum,
            signature,
            file_size,
            header_size,
            endian_tag,
            link,
            map_off,
            string_ids: section(&mut ix)?,
            type_ids: section(&mut ix)?,
            proto_ids: section(&mut ix)?,
            field_ids: section(&mut ix)?,
            method_ids: section(&mut ix)?,
            class_defs: section(&mut ix)?,
            data: section(&mut ix)?,
        };

        if header.endian_tag == REVERSE_ENDIAN_CONSTANT {
            fail!("Big-endian DEX files are not supported");
        }
        if header.endian_tag != ENDIAN_CONSTANT {
            fail!("Bad endian tag 0x{:08x}", header.endian_tag);
        }
        if header.file_size as usize != bytes.len() {
            fail!("Header file_size {} does not match mapped size {}", header.file_size, bytes.len());
        }
        if header.header_size != HEADER_SIZE {
            fail!("Unexpected header_size 0x{:x}", header.header_size);
        }
        for (name, s, width) in [
            ("string_ids", header.string_ids, 4u64),
            ("type_ids", header.type_ids, 4),
            ("proto_ids", header.proto_ids, 12),
            ("field_ids", header.field_ids, 8),
            ("method_ids", header.method_ids, 8),
            ("class_defs", header.class_defs, 32),
        ] {
            if s.off as u64 + s.size as u64 * width > bytes.len() as u64 {
                fail!("{} table (size {}, offset 0x{:x}) extends past end of file", name, s.size, s.off);
            }
        }
        Ok(header)
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = write_x(bytes, &self.version.magic());
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        c += write_u4(bytes, self.file_size);
        c += write_u4(bytes, self.header_size);
        c += write_u4(bytes, self.endian_tag);
        c += write_u4(bytes, self.link.size);
        c += write_u4(bytes, self.link.off);
        c += write_u4(bytes, self.map_off);
        for s in [
            self.string_ids,
            self.type_ids,
            self.proto_ids,
            self.field_ids,
            self.method_ids,
            self.class_defs,
            self.data,
        ] {
            c += write_u4(bytes, s.size);
            c += write_u4(bytes, s.off);
        }
        c
    }
}

/// Writes `header` over the start of `file`, then fills in the SHA-1
/// signature and Adler-32 checksum, in that order.
pub fn finalize_file(file: &mut [u8], header: &DexHeader) {
    let mut header_bytes = Vec::with_capacity(HEADER_SIZE as usize);
    header.write(&mut header_bytes);
    file[..HEADER_SIZE as usize].copy_from_slice(&header_bytes);

    let mut hasher = Sha1::new();
    hasher.update(&file[32..]);
    let digest = hasher.finalize();
    file[12..32].copy_from_slice(&digest);

    let checksum = adler32_slice(&file[12..]);
    file[8..12].copy_from_slice(&checksum.to_le_bytes());
}

/// Recomputes the Adler-32 checksum of a file image.
pub fn compute_checksum(file: &[u8]) -> u32 {
    adler32_slice(&file[12..])
}
