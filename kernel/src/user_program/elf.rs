use nom::bytes::complete::{tag, take};
use nom::combinator::map_opt;
use nom::error::Error;
use nom::number::complete::{u16, u32, u8};
use nom::number::Endianness;
use nom::IResult;

use alloc::vec::Vec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfEndianness {
    Little,
    Big,
}

impl ElfEndianness {
    fn to_nom(self) -> Endianness {
        match self {
            ElfEndianness::Little => Endianness::Little,
            ElfEndianness::Big => Endianness::Big,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
}

// Common Architectures from https://wiki.osdev.org/ELF
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfArchitecture {
    Generic,
    Sparc,
    Mips,
    PowerPC,
    RiscV,
    Ia64,
    X86,
    X8664,
    Arm,
    Arm64,
}

// Strictly 32-bit ELFs.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub endianness: ElfEndianness,
    pub header_version: u8,
    pub abi: u8,
    pub usage: ElfUsage,
    pub architecture: ElfArchitecture,
    pub elf_version: u32,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub section_headers_offset: u32,
    pub flags: u32,
    pub elf_header_size: u16,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
    pub section_header_entry_size: u16,
    pub section_header_count: u16,
    pub section_header_index: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, _) = tag([0x7F, b'E', b'L', b'F'])(bytes)?;

        // Elf Bit Width, we don't parse 64-bits ELF binaries.
        let (bytes, _) = tag([1])(bytes)?;

        let (bytes, endianness) = map_opt(u8, |value| match value {
            1 => Some(ElfEndianness::Little),
            2 => Some(ElfEndianness::Big),
            _ => None,
        })(bytes)?;

        let endian = endianness.to_nom();

        let (bytes, header_version) = u8(bytes)?;
        let (bytes, abi) = u8(bytes)?;

        let (bytes, _) = take(8usize)(bytes)?;

        let (bytes, usage) = map_opt(u16(endian), |value| match value {
            1 => Some(ElfUsage::Relocatable),
            2 => Some(ElfUsage::Executable),
            3 => Some(ElfUsage::Shared),
            4 => Some(ElfUsage::Core),
            _ => None,
        })(bytes)?;

        let (bytes, architecture) = map_opt(u16(endian), |value| match value {
            0x00 => Some(ElfArchitecture::Generic),
            0x02 => Some(ElfArchitecture::Sparc),
            0x03 => Some(ElfArchitecture::X86),
            0x08 => Some(ElfArchitecture::Mips),
            0x14 => Some(ElfArchitecture::PowerPC),
            0x28 => Some(ElfArchitecture::Arm),
            0x32 => Some(ElfArchitecture::Ia64),
            0x3E => Some(ElfArchitecture::X8664),
            0xB7 => Some(ElfArchitecture::Arm64),
            0xF3 => Some(ElfArchitecture::RiscV),
            _ => None,
        })(bytes)?;

        let (bytes, elf_version) = u32(endian)(bytes)?;
        let (bytes, program_entry) = u32(endian)(bytes)?;
        let (bytes, program_headers_offset) = u32(endian)(bytes)?;
        let (bytes, section_headers_offset) = u32(endian)(bytes)?;

        let (bytes, flags) = u32(endian)(bytes)?;

        let (bytes, elf_header_size) = u16(endian)(bytes)?;
        let (bytes, program_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, program_header_count) = u16(endian)(bytes)?;
        let (bytes, section_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, section_header_count) = u16(endian)(bytes)?;
        let (bytes, section_header_index) = u16(endian)(bytes)?;

        Ok((
            bytes,
            ElfHeader {
                endianness,
                header_version,
                abi,
                usage,
                architecture,
                elf_version,
                program_entry,
                program_headers_offset,
                section_headers_offset,
                flags,
                elf_header_size,
                program_header_entry_size,
                program_header_count,
                section_header_entry_size,
                section_header_count,
                section_header_index,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    OsSpecific(u32),
}

/// A segment. Its contents stay in the file and are read in page by page on demand.
#[derive(Copy, Clone, Debug)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub physical_address: u32,
    pub file_size: u32,
    pub memory_size: u32,
    pub executable: bool,
    pub writable: bool,
    pub readable: bool,
    pub alignment: u32,
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, program_type) = map_opt(u32(endian), |value| match value {
            0 => Some(ElfProgramType::Ignore),
            1 => Some(ElfProgramType::Load),
            2 => Some(ElfProgramType::Dynamic),
            3 => Some(ElfProgramType::Interpret),
            4 => Some(ElfProgramType::Note),
            0x60000000.. => Some(ElfProgramType::OsSpecific(value)), // OS Specific Headers
            _ => None,
        })(bytes)?;

        let (bytes, file_offset) = u32(endian)(bytes)?;
        let (bytes, virtual_address) = u32(endian)(bytes)?;
        let (bytes, physical_address) = u32(endian)(bytes)?;
        let (bytes, file_size) = u32(endian)(bytes)?;
        let (bytes, memory_size) = u32(endian)(bytes)?;
        let (bytes, flags) = u32(endian)(bytes)?;
        let (bytes, alignment) = u32(endian)(bytes)?;

        let executable = flags & 1 != 0;
        let writable = flags & 2 != 0;
        let readable = flags & 4 != 0;

        Ok((
            bytes,
            ElfProgramHeader {
                program_type,
                file_offset,
                virtual_address,
                physical_address,
                file_size,
                memory_size,
                executable,
                writable,
                readable,
                alignment,
            },
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Elf {
    pub header: ElfHeader,
    pub program_headers: Vec<ElfProgramHeader>,
}

impl Elf {
    pub fn parse(full_bytes: &[u8]) -> IResult<&[u8], Elf> {
        let (bytes, header) = ElfHeader::parse(full_bytes)?;

        let (mut program_header_bytes, _) = take(header.program_headers_offset)(full_bytes)?;

        let mut program_headers = Vec::with_capacity(header.program_header_count as usize);

        for _ in 0..header.program_header_count {
            let (_, program_header) =
                ElfProgramHeader::parse(program_header_bytes, header.endianness.to_nom())?;

            program_headers.push(program_header);

            (program_header_bytes, _) =
                take(header.program_header_entry_size)(program_header_bytes)?;
        }

        Ok((
            bytes,
            Elf {
                header,
                program_headers,
            },
        ))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Elf, nom::Err<Error<&[u8]>>> {
        Ok(Self::parse(bytes)?.1)
    }
}

#[cfg(test)]
pub mod test {
    use alloc::vec::Vec;

    pub struct Segment<'a> {
        pub vaddr: u32,
        pub offset: u32,
        pub data: &'a [u8],
        pub memory_size: u32,
        pub flags: u32,
    }

    /// A little-endian x86 executable with one program header per segment. Segment data is
    /// placed at its file offset, zero-padded.
    pub fn build(entry: u32, segments: &[Segment]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        bytes.extend_from_slice(&[0; 8]);
        for half in [2u16, 3] {
            bytes.extend_from_slice(&half.to_le_bytes());
        }
        for word in [1u32, entry, 52, 0, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        for half in [52u16, 32, segments.len() as u16, 40, 0, 0] {
            bytes.extend_from_slice(&half.to_le_bytes());
        }
        for segment in segments {
            let words = [
                1,
                segment.offset,
                segment.vaddr,
                segment.vaddr,
                segment.data.len() as u32,
                segment.memory_size,
                segment.flags,
                0x1000,
            ];
            for word in words {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
        }
        for segment in segments {
            let end = segment.offset as usize + segment.data.len();
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[segment.offset as usize..end].copy_from_slice(segment.data);
        }
        bytes
    }
}
