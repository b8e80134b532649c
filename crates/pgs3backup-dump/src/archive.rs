//! Tar framing of archive entries onto a pipe
//!
//! Each entry is a 512-byte header carrying the name and body length,
//! followed by the body padded to the next 512-byte boundary. A clean end
//! appends two zero blocks. Names longer than the 100-byte header field are
//! preceded by a GNU long-name record.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use pgs3backup_core::{DumpError, Result};
use tar::{EntryType, Header};

use crate::pipe::PipeWriter;

const BLOCK_SIZE: usize = 512;
const NAME_FIELD_LEN: usize = 100;
const ENTRY_MODE: u32 = 0o600;
const LONG_NAME_PATH: &str = "././@LongLink";

static ZEROS: [u8; 2 * BLOCK_SIZE] = [0; 2 * BLOCK_SIZE];

fn padding(len: usize) -> usize {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

/// Encode the header block(s) of one regular-file entry.
///
/// Returns one block for names that fit the header, or a long-name record
/// followed by the header otherwise.
pub fn encode_header(name: &str, size: u64, mtime: u64) -> Result<Vec<u8>> {
    if name.is_empty() {
        return Err(DumpError::Framing("entry name is empty".to_string()));
    }

    let mut out = Vec::with_capacity(BLOCK_SIZE);
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(ENTRY_MODE);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);

    // Names are written verbatim: `set_path` would reject `..` components
    // and normalise away `.` ones, both legal in table names.
    let name_bytes = name.as_bytes();
    if name_bytes.len() <= NAME_FIELD_LEN {
        header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
    } else {
        let mut long_name = Header::new_gnu();
        long_name.as_old_mut().name[..LONG_NAME_PATH.len()]
            .copy_from_slice(LONG_NAME_PATH.as_bytes());
        long_name.set_entry_type(EntryType::GNULongName);
        long_name.set_size(name_bytes.len() as u64 + 1);
        long_name.set_mode(ENTRY_MODE);
        long_name.set_mtime(0);
        long_name.set_cksum();
        out.extend_from_slice(long_name.as_bytes());

        out.extend_from_slice(name_bytes);
        out.push(0);
        out.extend_from_slice(&ZEROS[..padding(name_bytes.len() + 1)]);

        header.as_old_mut().name[..NAME_FIELD_LEN]
            .copy_from_slice(&name_bytes[..NAME_FIELD_LEN]);
    }

    header.set_cksum();
    out.extend_from_slice(header.as_bytes());
    Ok(out)
}

/// Writes framed entries to a pipe, in the order they are appended
pub struct ArchiveWriter {
    out: PipeWriter,
    chunk_size: usize,
    mtime: u64,
    entries: usize,
}

impl ArchiveWriter {
    /// `mtime` is stamped on every entry so one archive carries one timestamp
    pub fn new(out: PipeWriter, chunk_size: usize, mtime: DateTime<Utc>) -> Self {
        Self {
            out,
            chunk_size: chunk_size.max(BLOCK_SIZE),
            mtime: u64::try_from(mtime.timestamp()).unwrap_or(0),
            entries: 0,
        }
    }

    /// Frame one entry. The body is sent as slices of at most `chunk_size`
    /// bytes without copying.
    pub async fn append(&mut self, name: &str, body: Bytes) -> Result<()> {
        let header = encode_header(name, body.len() as u64, self.mtime)?;
        self.out.write(Bytes::from(header)).await?;

        let len = body.len();
        let mut offset = 0;
        while offset < len {
            let end = (offset + self.chunk_size).min(len);
            self.out.write(body.slice(offset..end)).await?;
            offset = end;
        }

        let pad = padding(len);
        if pad > 0 {
            self.out.write(Bytes::from_static(&ZEROS[..pad])).await?;
        }

        self.entries += 1;
        tracing::debug!(entry = name, bytes = len, "framed archive entry");
        Ok(())
    }

    /// Write the end-of-archive trailer and finish the stream.
    ///
    /// Returns the total archive size in bytes.
    pub async fn finish(mut self) -> Result<u64> {
        self.out.write(Bytes::from_static(&ZEROS)).await?;
        let bytes = self.out.finish().await?;
        tracing::debug!(entries = self.entries, bytes, "archive trailer written");
        Ok(bytes)
    }

    /// Abort the stream without a trailer
    pub async fn fail(self, err: DumpError) {
        self.out.fail(err).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{PipeReader, pipe};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::io::Read;

    async fn collect(mut reader: PipeReader) -> (Vec<u8>, Option<DumpError>) {
        let mut bytes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await {
            match chunk {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(e) => return (bytes, Some(e)),
            }
        }
        (bytes, None)
    }

    fn read_entries(archive: &[u8]) -> Vec<(String, Vec<u8>, u64, u32)> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mtime = entry.header().mtime().unwrap();
                let mode = entry.header().mode().unwrap();
                let mut body = Vec::new();
                entry.read_to_end(&mut body).unwrap();
                (name, body, mtime, mode)
            })
            .collect()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_short_name_is_one_block() {
        let header = encode_header("schema.sql", 10, 0).unwrap();
        assert_eq!(header.len(), BLOCK_SIZE);
        assert_eq!(&header[..10], b"schema.sql");
    }

    #[tokio::test]
    async fn test_dot_segments_in_names_are_kept_verbatim() {
        let names = ["data/public.a/../b.csv", "data/public.x/./y.csv", "data/s../..t.csv"];
        let (writer, reader) = pipe(64);
        let mut archive = ArchiveWriter::new(writer, 512, at());
        for name in names {
            archive.append(name, Bytes::from_static(b"id\n")).await.unwrap();
        }
        archive.finish().await.unwrap();

        let (bytes, err) = collect(reader).await;
        assert!(err.is_none());
        let mut archive = tar::Archive::new(&bytes[..]);
        let stored: Vec<Vec<u8>> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path_bytes().into_owned())
            .collect();
        let expected: Vec<Vec<u8>> = names.iter().map(|n| n.as_bytes().to_vec()).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_empty_name_is_framing_error() {
        assert!(matches!(encode_header("", 0, 0), Err(DumpError::Framing(_))));
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 511);
        assert_eq!(padding(512), 0);
        assert_eq!(padding(513), 511);
    }

    #[tokio::test]
    async fn test_entries_round_trip_through_tar_reader() {
        let (writer, reader) = pipe(64);
        let mut archive = ArchiveWriter::new(writer, 512, at());
        let big = Bytes::from(vec![b'x'; 1300]);
        archive
            .append("schema.sql", Bytes::from_static(b"CREATE TABLE t ();\n\n"))
            .await
            .unwrap();
        archive.append("data/public.t.csv", big.clone()).await.unwrap();
        archive.append("data/public.empty.csv", Bytes::new()).await.unwrap();
        let total = archive.finish().await.unwrap();

        let (bytes, err) = collect(reader).await;
        assert!(err.is_none());
        assert_eq!(bytes.len() as u64, total);
        assert_eq!(bytes.len() % BLOCK_SIZE, 0);
        assert!(bytes.ends_with(&ZEROS));

        let entries = read_entries(&bytes);
        let names: Vec<&str> = entries.iter().map(|e| e.0.as_str()).collect();
        assert_eq!(names, vec!["schema.sql", "data/public.t.csv", "data/public.empty.csv"]);
        assert_eq!(entries[0].1, b"CREATE TABLE t ();\n\n");
        assert_eq!(entries[1].1, big.to_vec());
        assert!(entries[2].1.is_empty());
        for (_, _, mtime, mode) in &entries {
            assert_eq!(*mtime, at().timestamp() as u64);
            assert_eq!(*mode, 0o600);
        }
    }

    #[tokio::test]
    async fn test_long_names_use_gnu_long_name_record() {
        let name = format!("data/{}.{}.csv", "s".repeat(70), "t".repeat(70));
        let (writer, reader) = pipe(64);
        let mut archive = ArchiveWriter::new(writer, 4096, at());
        archive.append(&name, Bytes::from_static(b"id\n")).await.unwrap();
        archive.finish().await.unwrap();

        let (bytes, _) = collect(reader).await;
        let entries = read_entries(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, name);
        assert_eq!(entries[0].1, b"id\n");
    }

    #[tokio::test]
    async fn test_failed_archive_has_no_trailer() {
        let (writer, reader) = pipe(64);
        let mut archive = ArchiveWriter::new(writer, 512, at());
        archive.append("schema.sql", Bytes::from_static(b"x")).await.unwrap();
        archive.fail(DumpError::Query("lost".into())).await;

        let (bytes, err) = collect(reader).await;
        assert_eq!(err, Some(DumpError::Query("lost".into())));
        assert_eq!(bytes.len(), 2 * BLOCK_SIZE);
    }

    #[tokio::test]
    async fn test_body_is_chunked() {
        let (writer, mut reader) = pipe(64);
        let mut archive = ArchiveWriter::new(writer, 512, at());
        archive
            .append("a", Bytes::from(vec![1u8; 1200]))
            .await
            .unwrap();
        archive.finish().await.unwrap();

        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await {
            sizes.push(chunk.unwrap().len());
        }
        assert_eq!(sizes, vec![512, 512, 512, 176, 336, 1024]);
    }
}
