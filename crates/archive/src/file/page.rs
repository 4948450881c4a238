//! Page file format.
//!
//! A page holds a contiguous run of a table's slots for a fixed list of
//! channels. Slots sit at fixed offsets, so writing a slice or a single
//! value is an overwrite in place.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Page Header (40 bytes)                                      │
//! │  - Magic: "ARCP" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Page Number: u32 (4 bytes)                                │
//! │  - Slot Count: u32 (4 bytes)                                 │
//! │  - Channel List ID: u64 (8 bytes)                            │
//! │  - Channel Count: u32 (4 bytes)                              │
//! │  - Header CRC32: u32 (4 bytes)                               │
//! │  - Reserved: 8 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Channel Numbers: i32 × channel count                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Slots (repeated slot count times)                           │
//! │  - Timestamp: i64 epoch millis, 0 = empty (8 bytes)          │
//! │  - Per channel: f64 value (8 bytes) + u8 status (1 byte)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header CRC covers the first 28 header bytes and the channel numbers.

use crate::data::{from_millis, to_millis, ChannelNumberList, ChannelValue, Timestamp};
use crate::error::{ArchiveError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes of a page file: "ARCP"
pub const PAGE_MAGIC: [u8; 4] = *b"ARCP";

/// Current page format version.
pub const PAGE_VERSION: u16 = 1;

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 40;

/// Size of a slot timestamp in bytes.
pub const SLOT_TIMESTAMP_SIZE: usize = 8;

/// Size of one stored channel value in bytes.
pub const VALUE_SIZE: usize = 9;

/// Upper bound on channels per page accepted when reading.
pub const MAX_PAGE_CHANNELS: u32 = 1 << 20;

const EMPTY_SLOT: i64 = 0;

/// Page header with its channel list.
#[derive(Debug, Clone)]
pub struct PageHeader {
    /// Page number inside the table.
    pub page_number: u32,
    /// Number of slots in the page.
    pub slot_count: u32,
    /// Channels stored in every slot.
    pub channels: ChannelNumberList,
}

impl PageHeader {
    /// Creates a header.
    pub fn new(page_number: u32, slot_count: u32, channels: ChannelNumberList) -> Self {
        Self {
            page_number,
            slot_count,
            channels,
        }
    }

    /// Size of one slot in bytes.
    pub fn slot_size(&self) -> usize {
        slot_size(self.channels.len())
    }

    /// Offset of the first slot.
    pub fn data_offset(&self) -> u64 {
        (PAGE_HEADER_SIZE + 4 * self.channels.len()) as u64
    }

    /// Total file size.
    pub fn file_size(&self) -> u64 {
        self.data_offset() + u64::from(self.slot_count) * self.slot_size() as u64
    }

    fn fixed_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        // Magic (4 bytes)
        buf[0..4].copy_from_slice(&PAGE_MAGIC);
        // Version (2 bytes)
        buf[4..6].copy_from_slice(&PAGE_VERSION.to_le_bytes());
        // Reserved (2 bytes)
        // Page number (4 bytes)
        buf[8..12].copy_from_slice(&self.page_number.to_le_bytes());
        // Slot count (4 bytes)
        buf[12..16].copy_from_slice(&self.slot_count.to_le_bytes());
        // Channel list ID (8 bytes)
        buf[16..24].copy_from_slice(&self.channels.list_id().to_le_bytes());
        // Channel count (4 bytes)
        buf[24..28].copy_from_slice(&(self.channels.len() as u32).to_le_bytes());
        // Header CRC (4 bytes), then reserved (8 bytes)
        buf
    }

    /// Writes the header and channel numbers using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = self.fixed_bytes();
        let numbers = encode_numbers(self.channels.numbers());
        let crc = header_crc(&buf, &numbers);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());

        writer.write_all(&buf)?;
        writer.write_all(&numbers)?;
        Ok(())
    }

    /// Reads a header.
    ///
    /// `lookup` may supply the channel list for the stored list ID. A supplied
    /// list that passes the checksum is reused and the channel numbers on disk
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::InvalidMagic`, `ArchiveError::UnsupportedVersion`
    /// or `ArchiveError::ChecksumMismatch` for damaged headers.
    pub fn read_from<R: Read + Seek>(
        reader: &mut R,
        lookup: impl FnOnce(u64) -> Option<ChannelNumberList>,
    ) -> Result<Self> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        // Magic (4 bytes)
        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != PAGE_MAGIC {
            return Err(ArchiveError::InvalidMagic {
                expected: PAGE_MAGIC,
                actual: magic,
            });
        }

        // Version (2 bytes)
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version > PAGE_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }

        let page_number = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let slot_count = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let list_id = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let channel_count = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        let expected = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        buf[28..32].fill(0);

        if channel_count > MAX_PAGE_CHANNELS {
            return Err(ArchiveError::ChecksumMismatch {
                expected,
                actual: 0,
            });
        }

        if let Some(cached) = lookup(list_id) {
            let numbers = encode_numbers(cached.numbers());
            if cached.len() == channel_count as usize && header_crc(&buf, &numbers) == expected {
                reader.seek(SeekFrom::Current(numbers.len() as i64))?;
                return Ok(Self::new(page_number, slot_count, cached));
            }
        }

        let mut numbers = vec![0u8; 4 * channel_count as usize];
        reader.read_exact(&mut numbers)?;
        let actual = header_crc(&buf, &numbers);
        if actual != expected {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }

        let channels = numbers
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(Self::new(
            page_number,
            slot_count,
            ChannelNumberList::with_id(list_id, channels),
        ))
    }
}

fn slot_size(channel_count: usize) -> usize {
    SLOT_TIMESTAMP_SIZE + VALUE_SIZE * channel_count
}

fn encode_numbers(numbers: &[i32]) -> Vec<u8> {
    numbers.iter().flat_map(|n| n.to_le_bytes()).collect()
}

fn header_crc(fixed: &[u8; PAGE_HEADER_SIZE], numbers: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&fixed[0..28]);
    hasher.update(numbers);
    hasher.finalize()
}

fn encode_value(value: &ChannelValue, out: &mut [u8]) {
    out[0..8].copy_from_slice(&value.value.to_le_bytes());
    out[8] = value.status;
}

fn decode_value(bytes: &[u8]) -> ChannelValue {
    ChannelValue {
        value: f64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        status: bytes[8],
    }
}

/// Slots read from a page in one pass.
#[derive(Debug, Clone)]
pub struct SlotBlock {
    first: u32,
    slot_size: usize,
    bytes: Vec<u8>,
}

impl SlotBlock {
    /// Index of the first slot in the block.
    pub fn first(&self) -> u32 {
        self.first
    }

    /// Number of slots in the block.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.slot_size
    }

    /// Returns true if the block holds no slots.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Timestamp of the `i`-th slot of the block, `None` if the slot is empty.
    pub fn timestamp(&self, i: usize) -> Option<Timestamp> {
        let offset = i * self.slot_size;
        let millis = i64::from_le_bytes(self.bytes[offset..offset + 8].try_into().unwrap());
        (millis != EMPTY_SLOT).then(|| from_millis(millis))
    }

    /// Value of a channel column in the `i`-th slot of the block.
    pub fn value(&self, i: usize, column: usize) -> ChannelValue {
        let offset = i * self.slot_size + SLOT_TIMESTAMP_SIZE + column * VALUE_SIZE;
        decode_value(&self.bytes[offset..offset + VALUE_SIZE])
    }
}

/// An open page file.
#[derive(Debug)]
pub struct PageFile {
    path: PathBuf,
    file: File,
    header: PageHeader,
}

impl PageFile {
    /// Creates a page with every slot empty, replacing any existing file.
    pub fn create(path: &Path, header: PageHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        header.write_to(&mut file)?;
        file.set_len(header.file_size())?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
        })
    }

    /// Opens an existing page.
    ///
    /// # Errors
    ///
    /// Returns the header errors of [`PageHeader::read_from`], and
    /// `ArchiveError::CorruptPage` if the file is shorter than its layout.
    pub fn open(
        path: &Path,
        lookup: impl FnOnce(u64) -> Option<ChannelNumberList>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = PageHeader::read_from(&mut file, lookup)?;
        let len = file.metadata()?.len();
        if len < header.file_size() {
            return Err(ArchiveError::CorruptPage {
                path: path.to_path_buf(),
                reason: format!("file has {} bytes, layout needs {}", len, header.file_size()),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
        })
    }

    /// Path of the page file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header of the page.
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    fn slot_offset(&self, index: u32) -> Result<u64> {
        if index >= self.header.slot_count {
            return Err(ArchiveError::CorruptPage {
                path: self.path.clone(),
                reason: format!(
                    "slot {} out of range ({} slots)",
                    index, self.header.slot_count
                ),
            });
        }
        Ok(self.header.data_offset() + u64::from(index) * self.header.slot_size() as u64)
    }

    /// Writes a whole slot. `values` are aligned with the page channels.
    pub fn write_slot(
        &mut self,
        index: u32,
        timestamp: Timestamp,
        values: &[ChannelValue],
    ) -> Result<()> {
        let offset = self.slot_offset(index)?;
        let mut buf = vec![0u8; self.header.slot_size()];
        buf[0..8].copy_from_slice(&to_millis(timestamp).to_le_bytes());
        for (column, value) in values.iter().take(self.header.channels.len()).enumerate() {
            let start = SLOT_TIMESTAMP_SIZE + column * VALUE_SIZE;
            encode_value(value, &mut buf[start..start + VALUE_SIZE]);
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Writes one channel value of a slot and stamps the slot.
    pub fn write_value(
        &mut self,
        index: u32,
        timestamp: Timestamp,
        column: usize,
        value: &ChannelValue,
    ) -> Result<()> {
        let offset = self.slot_offset(index)?;
        let mut buf = [0u8; VALUE_SIZE];
        encode_value(value, &mut buf);

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&to_millis(timestamp).to_le_bytes())?;
        self.file
            .seek(SeekFrom::Start(offset + (SLOT_TIMESTAMP_SIZE + column * VALUE_SIZE) as u64))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Reads slots `[first, last)`.
    pub fn read_slots(&mut self, first: u32, last: u32) -> Result<SlotBlock> {
        let last = last.min(self.header.slot_count);
        let slot_size = self.header.slot_size();
        if first >= last {
            return Ok(SlotBlock {
                first,
                slot_size,
                bytes: Vec::new(),
            });
        }

        let offset = self.slot_offset(first)?;
        let mut bytes = vec![0u8; (last - first) as usize * slot_size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut bytes)?;
        Ok(SlotBlock {
            first,
            slot_size,
            bytes,
        })
    }

    /// Flushes written data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
