//! File-range read/write helpers shared by `TorrentStore`. A piece or block
//! byte range can span more than one file when pieces don't align with file
//! boundaries; these walk the file list once and stop as soon as the range
//! is satisfied.

use std::{
    io::{Read, Seek, Write},
    ops::Range,
};

use super::{store::TorrentFile, DiskError, Result};

/// Writes `data` starting at absolute torrent-byte `offset`. `files` must be
/// the (pre-sliced, via `file_range_for`) sequence of files that range
/// overlaps, in order.
pub fn write_range(files: &[TorrentFile], offset: usize, data: &[u8]) -> Result<()> {
    let mut total_offset = offset;
    let mut bytes_written = 0;

    for file in files {
        if bytes_written == data.len() {
            break;
        }

        let byte_range = file.byte_range();
        let file_offset = total_offset - byte_range.start;
        let remaining = data.len() - bytes_written;
        let file_remaining = byte_range.end - total_offset;
        let n = remaining.min(file_remaining);

        let mut f = file.file_lock.write()?;
        f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        let written = f.write(&data[bytes_written..bytes_written + n])?;

        total_offset += written;
        bytes_written += written;
    }

    if bytes_written != data.len() {
        return Err(DiskError::IoSizeError { expected: data.len(), actual: bytes_written });
    }
    Ok(())
}

pub fn read_range(files: &[TorrentFile], offset: usize, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut total_offset = offset;
    let mut bytes_read = 0;

    for file in files {
        if bytes_read == len {
            break;
        }

        let byte_range = file.byte_range();
        let file_offset = total_offset - byte_range.start;
        let remaining = len - bytes_read;
        let file_remaining = byte_range.end - total_offset;
        let n = remaining.min(file_remaining);

        let mut f = file.file_lock.write()?;
        f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        let read = f.read(&mut buf[bytes_read..bytes_read + n])?;

        total_offset += read;
        bytes_read += read;
    }

    if bytes_read != len {
        return Err(DiskError::IoSizeError { expected: len, actual: bytes_read });
    }
    Ok(buf)
}

/// The file index range a piece's bytes span, used to slice `files` down to
/// just the ones a given read/write touches.
pub fn file_range_for(files: &[TorrentFile], offset: usize, len: usize) -> Range<usize> {
    if files.len() == 1 {
        return 0..1;
    }

    let end = offset + len;
    let start_file = files
        .iter()
        .position(|f| f.byte_range().contains(&offset))
        .expect("byte offset exceeds file length");
    let end_file = files[start_file..]
        .iter()
        .position(|f| f.byte_range().contains(&(end - 1)))
        .map(|idx| start_file + idx)
        .expect("byte offset exceeds file length");

    start_file..(end_file + 1)
}
