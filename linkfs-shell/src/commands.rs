use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use linkfs::io::FileImage;
use linkfs::{mkfs, Descriptors, Fd, Session};
use log::info;

pub const COMMANDS: &[&str] = &[
    "mkfs", "mount", "umount", "filestat", "ls", "create", "open", "close", "read", "write",
    "seek", "link", "unlink", "truncate", "check", "echo", "help", "exit",
];

/// What the read loop should do after a command.
#[derive(Debug, PartialEq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Command interpreter state: at most one mounted image plus its descriptors.
pub struct Shell {
    mounted: Option<Session<FileImage>>,
    fds: Descriptors,
}

impl Shell {
    pub fn new() -> Self {
        Self {
            mounted: None,
            fds: Descriptors::new(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    pub fn mount<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        if self.mounted.is_some() {
            bail!("an image is already mounted, umount it first");
        }
        let path = path.as_ref();
        let session =
            Session::mount(path).with_context(|| format!("mounting {}", path.display()))?;
        self.mounted = Some(session);
        Ok(())
    }

    fn session(&mut self) -> anyhow::Result<&mut Session<FileImage>> {
        self.mounted
            .as_mut()
            .ok_or_else(|| anyhow!("no image mounted"))
    }

    /// Runs one input line, writing any output to `out`.
    pub fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> anyhow::Result<Flow> {
        let argv: Vec<&str> = line.split_whitespace().collect();
        let (command, args) = match argv.split_first() {
            Some((command, args)) => (*command, args),
            None => return Ok(Flow::Continue),
        };

        match command {
            "echo" => writeln!(out, "{}", args.join(" "))?,
            "help" => writeln!(out, "commands: {}", COMMANDS.join(", "))?,
            "exit" => return Ok(Flow::Exit),
            "mkfs" => {
                let path = arg(args, 0, "path")?;
                mkfs(path).with_context(|| format!("formatting {}", path))?;
            }
            "mount" => self.mount(arg(args, 0, "path")?)?,
            "umount" => {
                let session = self
                    .mounted
                    .take()
                    .ok_or_else(|| anyhow!("no image mounted"))?;
                self.fds.clear();
                session.umount()?;
                info!("image released");
            }
            "filestat" => {
                let id = number(args, 0, "id")?;
                let stat = self.session()?.filestat(id)?;
                writeln!(out, "Stats for node {}", id)?;
                writeln!(out, "Active links: {}", stat.active_links)?;
                writeln!(out, "Blocks count: {}", stat.blocks.len())?;
                let list: Vec<String> = stat.blocks.iter().map(u16::to_string).collect();
                writeln!(out, "Block list: {}", list.join(", "))?;
            }
            "ls" => {
                for (name, id) in self.session()?.ls()? {
                    writeln!(out, "{}: {}", name, id)?;
                }
            }
            "create" => {
                let name = arg(args, 0, "name")?;
                self.session()?.create(name)?;
            }
            "open" => {
                let name = arg(args, 0, "name")?;
                let fs = self.mounted.as_mut().ok_or_else(|| anyhow!("no image mounted"))?;
                let fd = self.fds.open(fs, name)?;
                writeln!(out, "{}", fd)?;
            }
            "close" => {
                self.session()?;
                self.fds.close(number(args, 0, "fd")?)?;
            }
            "seek" => {
                self.session()?;
                self.fds
                    .seek(number(args, 0, "fd")?, number(args, 1, "pos")?)?;
            }
            "read" => {
                let fd: Fd = number(args, 0, "fd")?;
                let size: usize = number(args, 1, "size")?;
                let fs = self.mounted.as_mut().ok_or_else(|| anyhow!("no image mounted"))?;
                let data = self.fds.read(fs, fd, size)?;
                writeln!(out, "{}", String::from_utf8_lossy(&data))?;
            }
            "write" => {
                let fd: Fd = number(args, 0, "fd")?;
                let data = args.get(1..).unwrap_or(&[]).join(" ");
                let fs = self.mounted.as_mut().ok_or_else(|| anyhow!("no image mounted"))?;
                let written = self.fds.write(fs, fd, data.as_bytes())?;
                writeln!(out, "{} bytes written", written)?;
            }
            "link" => {
                let old = arg(args, 0, "old name")?;
                let new = arg(args, 1, "new name")?;
                self.session()?.link(old, new)?;
            }
            "unlink" => {
                let name = arg(args, 0, "name")?;
                self.session()?.unlink(name)?;
            }
            "truncate" => {
                let name = arg(args, 0, "name")?;
                let size = number(args, 1, "size")?;
                self.session()?.truncate(name, size)?;
            }
            "check" => {
                self.session()?.check()?;
                writeln!(out, "image is consistent")?;
            }
            _ => writeln!(out, "Unknown command")?,
        }
        Ok(Flow::Continue)
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

fn arg<'a>(args: &[&'a str], index: usize, what: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| anyhow!("missing argument: {}", what))
}

fn number<T>(args: &[&str], index: usize, what: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = arg(args, index, what)?;
    raw.parse()
        .with_context(|| format!("{} must be a number, got {:?}", what, raw))
}
