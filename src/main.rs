//! Interactive skiff client
//!
//! A thin line REPL over the wire protocol: slash commands go out as COMMAND
//! messages, responses are rendered to stdout, downloads land in a local
//! directory. The server remains the authority for everything except the
//! small courtesy checks mirrored here (admin gate on /delete, usage hints).

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

use skiff::cli::ClientOpts;
use skiff::protocol::{
    self, Command, FileData, Message, Response, Role, CHUNK_SIZE,
};

struct Client {
    writer: OwnedWriteHalf,
    role: Role,
    downloads: PathBuf,
    /// Local path queued until the server acknowledges READY
    pending_upload: Option<PathBuf>,
    /// Target and byte count of the download in flight
    download: Option<(PathBuf, tokio::fs::File, u64)>,
}

impl Client {
    async fn send(&mut self, msg: &Message) -> Result<()> {
        let line = protocol::encode_line(msg)?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("send to server")?;
        Ok(())
    }

    async fn send_command(&mut self, cmd: Command) -> Result<()> {
        self.send(&Message::Command(cmd)).await
    }

    /// Handle one REPL line. Returns false when the user quits.
    async fn on_input(&mut self, line: &str) -> Result<bool> {
        let text = line.trim();
        if text.is_empty() {
            return Ok(true);
        }
        let cmd = text.split_whitespace().next().unwrap_or("");
        let rest = text[cmd.len()..].trim().to_string();
        match cmd {
            "/quit" | "/exit" => return Ok(false),
            "/read" | "/info" | "/download" | "/delete" => {
                if rest.is_empty() {
                    println!("Usage: {cmd} <filename>");
                    return Ok(true);
                }
                if cmd == "/delete" && self.role != Role::Admin {
                    println!("Delete requires admin");
                    return Ok(true);
                }
                self.send_command(Command {
                    command: cmd.to_string(),
                    filename: Some(rest),
                    keyword: None,
                    size: None,
                })
                .await?;
            }
            "/search" => {
                if rest.is_empty() {
                    println!("Usage: /search <keyword>");
                    return Ok(true);
                }
                self.send_command(Command {
                    command: cmd.to_string(),
                    filename: None,
                    keyword: Some(rest),
                    size: None,
                })
                .await?;
            }
            "/upload" => {
                if rest.is_empty() {
                    println!("Usage: /upload <local-path>");
                    return Ok(true);
                }
                let path = PathBuf::from(&rest);
                let meta = match tokio::fs::metadata(&path).await {
                    Ok(m) if m.is_file() => m,
                    _ => {
                        println!("No such file: {rest}");
                        return Ok(true);
                    }
                };
                let filename = match path.file_name() {
                    Some(n) => n.to_string_lossy().into_owned(),
                    None => {
                        println!("No such file: {rest}");
                        return Ok(true);
                    }
                };
                self.send_command(Command {
                    command: cmd.to_string(),
                    filename: Some(filename),
                    keyword: None,
                    size: Some(meta.len()),
                })
                .await?;
                self.pending_upload = Some(path);
            }
            // Anything else goes out as-is; the server names the rejection
            _ => {
                self.send_command(Command {
                    command: text.to_string(),
                    filename: None,
                    keyword: None,
                    size: None,
                })
                .await?;
            }
        }
        Ok(true)
    }

    /// Returns true when the prompt should be reprinted; intermediate
    /// download chunks keep quiet.
    async fn on_server(&mut self, line: &str) -> Result<bool> {
        let msg = match protocol::decode_line(line) {
            Ok(m) => m,
            Err(_) => {
                println!("Malformed server message");
                return Ok(true);
            }
        };
        match msg {
            Message::HelloAck { role } => {
                println!("Server welcome. Role: {}", role.as_str());
            }
            Message::Response(resp) => self.on_response(resp).await?,
            Message::FileData(fd) => {
                let finished = fd.is_final;
                self.on_file_data(fd).await?;
                return Ok(finished);
            }
            Message::Error { message } => println!("ERROR: {message}"),
            Message::Hello { .. } | Message::Command(_) => {}
        }
        Ok(true)
    }

    async fn on_response(&mut self, resp: Response) -> Result<()> {
        match resp {
            Response::List { files } => {
                println!("Server files:");
                for f in files {
                    println!("- {} ({} bytes)", f.name, f.size);
                }
            }
            Response::Read { filename, content } => {
                println!("{filename} contents (base64):\n{content}");
            }
            Response::Info {
                filename,
                size,
                created_at,
                modified_at,
            } => {
                println!("Info {filename} - Size: {size}, Created: {created_at}, Modified: {modified_at}");
            }
            Response::Search { files } => {
                if files.is_empty() {
                    println!("No matches");
                } else {
                    println!("Matches:");
                    for name in files {
                        println!("- {name}");
                    }
                }
            }
            Response::Delete { filename } => {
                println!("Deleted {filename}");
            }
            Response::Upload { filename, status } => {
                if status == "READY" {
                    self.run_upload(&filename).await?;
                } else {
                    println!("Upload {filename}: {status}");
                }
            }
        }
        Ok(())
    }

    /// Stream the queued local file once the server is READY
    async fn run_upload(&mut self, remote_name: &str) -> Result<()> {
        let path = match self.pending_upload.take() {
            Some(p) => p,
            None => {
                println!("Server is READY but no upload is pending");
                return Ok(());
            }
        };
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.send(&Message::FileData(FileData::chunk_of(remote_name, &buf[..n])))
                .await?;
            sent += n as u64;
        }
        self.send(&Message::FileData(FileData::terminal(remote_name)))
            .await?;
        println!("Uploaded {} ({} bytes) as {}", path.display(), sent, remote_name);
        Ok(())
    }

    async fn on_file_data(&mut self, fd: FileData) -> Result<()> {
        if self.download.is_none() {
            let base = match Path::new(&fd.filename).file_name() {
                Some(n) => n.to_os_string(),
                None => std::ffi::OsString::from("download.bin"),
            };
            let target = self.downloads.join(base);
            let file = tokio::fs::File::create(&target)
                .await
                .with_context(|| format!("create {}", target.display()))?;
            self.download = Some((target, file, 0));
        }
        let data = match protocol::decode_chunk(&fd.chunk) {
            Ok(d) => d,
            Err(_) => {
                println!("Undecodable chunk for {}", fd.filename);
                return Ok(());
            }
        };
        if let Some((_, file, bytes)) = self.download.as_mut() {
            if !data.is_empty() {
                file.write_all(&data).await?;
                *bytes += data.len() as u64;
            }
        }
        if fd.is_final {
            if let Some((target, mut file, bytes)) = self.download.take() {
                file.flush().await?;
                println!("Saved {} ({} bytes)", target.display(), bytes);
            }
        }
        Ok(())
    }
}

fn prompt(username: &str) {
    print!("{username}> ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    let username = opts
        .username
        .clone()
        .unwrap_or_else(|| format!("user_{}", std::process::id()));
    let role = Role::parse_loose(&opts.role);
    std::fs::create_dir_all(&opts.downloads)
        .with_context(|| format!("create downloads dir {}", opts.downloads.display()))?;

    let stream = TcpStream::connect(&opts.server)
        .await
        .with_context(|| format!("connect {}", opts.server))?;
    stream.set_nodelay(true).ok();
    let (read_half, writer) = stream.into_split();
    let mut server_lines = BufReader::new(read_half).lines();

    let mut client = Client {
        writer,
        role,
        downloads: opts.downloads.clone(),
        pending_upload: None,
        download: None,
    };
    client
        .send(&Message::Hello {
            username: username.clone(),
            role,
        })
        .await?;

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    prompt(&username);
    loop {
        tokio::select! {
            line = stdin_lines.next_line() => {
                match line? {
                    None => break,
                    Some(l) => {
                        if !client.on_input(&l).await? {
                            break;
                        }
                        prompt(&username);
                    }
                }
            }
            line = server_lines.next_line() => {
                match line? {
                    None => {
                        println!("Server closed the connection");
                        break;
                    }
                    Some(l) => {
                        if client.on_server(&l).await? {
                            prompt(&username);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
