//! Chunked file transfer engine
//!
//! Downloads stream the file in fixed-size chunks, one FILE_DATA line per
//! chunk in strict byte order, closed by an empty terminal chunk with
//! `final = true`. Uploads append decoded chunks to a write target owned by
//! the session's connection task. Streaming is push-based with no client
//! credit window; the transport's own buffering is the only backpressure,
//! which caps how far this design scales.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{self, FileData, Message, CHUNK_SIZE};
use crate::session::SessionHandle;
use crate::storage::Storage;
use crate::telemetry::Telemetry;

/// Stream one open file to the peer as FILE_DATA lines.
///
/// Returns the raw byte count streamed. Bails out between chunks when the
/// session's shutdown notify fires, so an evicted session never keeps
/// sending.
pub async fn stream_download<W>(
    writer: &mut W,
    handle: &SessionHandle,
    telemetry: &Telemetry,
    filename: &str,
    mut file: tokio::fs::File,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = tokio::select! {
            biased;
            _ = handle.shutdown.notified() => bail!("download of {filename} aborted"),
            r = file.read(&mut buf) => r.with_context(|| format!("read chunk of {filename}"))?,
        };
        if n == 0 {
            break;
        }
        let msg = Message::FileData(FileData::chunk_of(filename, &buf[..n]));
        send_counted(writer, handle, telemetry, &msg).await?;
        total += n as u64;
        handle.lock().add_transfer_bytes(n as u64);
    }
    let terminal = Message::FileData(FileData::terminal(filename));
    send_counted(writer, handle, telemetry, &terminal).await?;
    Ok(total)
}

async fn send_counted<W>(
    writer: &mut W,
    handle: &SessionHandle,
    telemetry: &Telemetry,
    msg: &Message,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = protocol::encode_line(msg)?;
    writer.write_all(line.as_bytes()).await?;
    handle.lock().bytes_sent += line.len() as u64;
    telemetry.record_sent(line.len() as u64);
    Ok(())
}

/// Write target for one in-flight upload.
///
/// Chunks accumulate in a staged dot-prefixed file; the final chunk moves it
/// onto the real name with one rename. A name therefore never resolves to
/// half-written content, and when two sessions race on the same name the last
/// rename decides, whole file against whole file. An aborted upload leaves
/// its staged partial behind and the real name untouched.
pub struct UploadSink {
    filename: String,
    temp: std::path::PathBuf,
    dest: std::path::PathBuf,
    file: tokio::fs::File,
    bytes_written: u64,
}

impl UploadSink {
    /// Open a fresh staged target under the storage root
    pub async fn create(storage: &Storage, filename: &str) -> Result<UploadSink> {
        let dest = storage.resolve(filename)?;
        let temp = storage.stage_path(filename)?;
        let file = tokio::fs::File::create(&temp)
            .await
            .with_context(|| format!("create {}", temp.display()))?;
        Ok(UploadSink {
            filename: filename.to_string(),
            temp,
            dest,
            file,
            bytes_written: 0,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .with_context(|| format!("append to {}", self.temp.display()))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush the staged file and move it onto its real name
    pub async fn finish(mut self) -> Result<u64> {
        self.file.flush().await?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("sync {}", self.temp.display()))?;
        tokio::fs::rename(&self.temp, &self.dest)
            .await
            .with_context(|| format!("rename {} into place", self.temp.display()))?;
        Ok(self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_chunk;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn test_handle() -> Arc<SessionHandle> {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let handle = Arc::new(SessionHandle::new(addr));
        handle
            .lock()
            .hello("t".into(), crate::protocol::Role::Read);
        handle
    }

    fn decode_stream(wire: &[u8]) -> Vec<FileData> {
        String::from_utf8(wire.to_vec())
            .unwrap()
            .lines()
            .map(|l| match protocol::decode_line(l).unwrap() {
                Message::FileData(fd) => fd,
                other => panic!("unexpected: {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_download_chunks_reassemble_exactly() {
        let dir = tempfile::tempdir().unwrap();
        // Three full chunks plus a remainder, patterned so order shows
        let content: Vec<u8> = (0..CHUNK_SIZE * 3 + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(dir.path().join("big.bin"), &content).unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let (file, _) = storage.open_read("big.bin").await.unwrap().unwrap();

        let handle = test_handle();
        let telemetry = Telemetry::new();
        let mut wire: Vec<u8> = Vec::new();
        let total = stream_download(&mut wire, &handle, &telemetry, "big.bin", file)
            .await
            .unwrap();
        assert_eq!(total, content.len() as u64);

        let frames = decode_stream(&wire);
        assert_eq!(frames.len(), 5);
        let last = frames.last().unwrap();
        assert!(last.is_final);
        assert!(last.chunk.is_empty());
        // No frame after the terminal one, none marked final before it
        assert!(frames[..frames.len() - 1].iter().all(|f| !f.is_final));

        let mut reassembled = Vec::new();
        for f in &frames[..frames.len() - 1] {
            reassembled.extend(decode_chunk(&f.chunk).unwrap());
        }
        assert_eq!(reassembled, content);
    }

    #[tokio::test]
    async fn test_download_empty_file_sends_only_terminal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let (file, _) = storage.open_read("empty").await.unwrap().unwrap();

        let handle = test_handle();
        let telemetry = Telemetry::new();
        let mut wire: Vec<u8> = Vec::new();
        let total = stream_download(&mut wire, &handle, &telemetry, "empty", file)
            .await
            .unwrap();
        assert_eq!(total, 0);
        let frames = decode_stream(&wire);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_final);
    }

    #[tokio::test]
    async fn test_download_aborts_on_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![0u8; CHUNK_SIZE * 4]).unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let (file, _) = storage.open_read("f").await.unwrap().unwrap();

        let handle = test_handle();
        handle.shutdown.notify_one();
        let telemetry = Telemetry::new();
        let mut wire: Vec<u8> = Vec::new();
        let err = stream_download(&mut wire, &handle, &telemetry, "f", file).await;
        assert!(err.is_err());
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_download_counts_wire_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let (file, _) = storage.open_read("f").await.unwrap().unwrap();

        let handle = test_handle();
        let telemetry = Telemetry::new();
        let mut wire: Vec<u8> = Vec::new();
        stream_download(&mut wire, &handle, &telemetry, "f", file)
            .await
            .unwrap();
        let sent = handle.lock().bytes_sent;
        assert_eq!(sent, wire.len() as u64);
        assert_eq!(
            telemetry.snapshot(Vec::new()).total_bytes_sent,
            wire.len() as u64
        );
    }

    #[tokio::test]
    async fn test_upload_sink_appends_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let mut sink = UploadSink::create(&storage, "up.bin").await.unwrap();
        sink.append(b"hello ").await.unwrap();
        sink.append(b"world").await.unwrap();
        assert_eq!(sink.bytes_written(), 11);
        let written = sink.finish().await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(
            std::fs::read(dir.path().join("up.bin")).unwrap(),
            b"hello world"
        );
        // Nothing staged is left once the rename lands
        assert!(find_staged(dir.path()).is_empty());
    }

    fn find_staged(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(".part"))
                    .unwrap_or(false)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_upload_sink_drop_keeps_staged_partial() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        {
            let mut sink = UploadSink::create(&storage, "part.bin").await.unwrap();
            sink.append(b"partial").await.unwrap();
            // Dropped without finish, as an evicted upload would be
        }
        // The real name never appeared
        assert!(!dir.path().join("part.bin").exists());
        // The staged write completes on the blocking pool; give it a moment
        for _ in 0..50u32 {
            let staged = find_staged(dir.path());
            if staged.len() == 1
                && std::fs::read(&staged[0]).map(|c| c == b"partial").unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("staged partial content never appeared");
    }

    #[tokio::test]
    async fn test_same_name_uploads_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let mut a = UploadSink::create(&storage, "clash.bin").await.unwrap();
        let mut b = UploadSink::create(&storage, "clash.bin").await.unwrap();
        // Interleaved appends from two writers
        a.append(&[b'a'; 100]).await.unwrap();
        b.append(&[b'b'; 300]).await.unwrap();
        a.append(&[b'a'; 100]).await.unwrap();
        b.append(&[b'b'; 300]).await.unwrap();
        a.finish().await.unwrap();
        b.finish().await.unwrap();
        // The last finished writer owns the name, whole file for whole file
        let content = std::fs::read(dir.path().join("clash.bin")).unwrap();
        assert_eq!(content, vec![b'b'; 600]);
    }
}
