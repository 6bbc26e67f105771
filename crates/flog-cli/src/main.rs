#![forbid(unsafe_code)]
//! `flog` — operate on FLogFS media images from the host.
//!
//! The image layout is the simulator's: per sector, payload bytes
//! followed by the 16-byte spare, in media order.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use flog_core::{Flogfs, Geometry};
use flog_flash::MemNand;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "flog", about = "FLogFS — append-only log filesystem for raw NAND, image toolkit")]
struct Cli {
    #[command(flatten)]
    geometry: GeometryArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GeometryArgs {
    /// Sector payload size in bytes.
    #[arg(long, default_value_t = 512)]
    sector_size: u32,
    /// Sectors per page.
    #[arg(long, default_value_t = 4)]
    sectors_per_page: u16,
    /// Pages per erase block.
    #[arg(long, default_value_t = 8)]
    pages_per_block: u16,
    /// Erase blocks on the media.
    #[arg(long, default_value_t = 64)]
    blocks: u16,
}

impl GeometryArgs {
    fn resolve(&self) -> Result<Geometry> {
        Geometry::new(
            self.sector_size,
            self.sectors_per_page,
            self.pages_per_block,
            self.blocks,
        )
        .context("invalid geometry")
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create (or re-create) a formatted image.
    Format {
        /// Path to the image; created if missing.
        image: PathBuf,
    },
    /// Print filesystem counters.
    Info {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List live files.
    Ls {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a file's contents to stdout.
    Cat { image: PathBuf, name: String },
    /// Append stdin (or a local file) to a file, creating it if absent.
    Put {
        image: PathBuf,
        name: String,
        /// Read from this file instead of stdin.
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Delete a file.
    Rm { image: PathBuf, name: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let geo = cli.geometry.resolve()?;

    match cli.command {
        Command::Format { image } => {
            let nand = if image.exists() {
                load_image(geo, &image)?
            } else {
                MemNand::new(geo)
            };
            let fs = Flogfs::new(Arc::new(nand.clone()))?;
            fs.format()?;
            save_image(&nand, &image)?;
            eprintln!("formatted {}", image.display());
        }
        Command::Info { image, json } => {
            let (fs, _nand) = mount_image(geo, &image)?;
            let stats = fs.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("media bytes:     {}", geo.media_bytes());
                println!("blocks:          {}", stats.n_blocks);
                println!("free blocks:     {}", stats.num_free_blocks);
                println!("mean free age:   {}", stats.mean_free_age);
                println!("max block age:   {}", stats.max_block_age);
                println!("max file id:     {}", stats.max_file_id);
                println!("timestamp:       {}", stats.timestamp);
            }
        }
        Command::Ls { image, json } => {
            let (fs, _nand) = mount_image(geo, &image)?;
            let files = fs.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                for file in files {
                    println!("{}", file.name);
                }
            }
        }
        Command::Cat { image, name } => {
            let (fs, _nand) = mount_image(geo, &image)?;
            let handle = fs.open_read(&name)?;
            let mut buf = vec![0_u8; 4096];
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            loop {
                let n = fs.read(&handle, &mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            fs.close_read(handle)?;
        }
        Command::Put { image, name, input } => {
            let data = match input {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let (fs, nand) = mount_image(geo, &image)?;
            let handle = fs.open_write(&name)?;
            let written = fs.write(&handle, &data)?;
            fs.close_write(handle)?;
            save_image(&nand, &image)?;
            if written < data.len() {
                bail!("media full: wrote {written} of {} bytes", data.len());
            }
            eprintln!("wrote {written} bytes to {name}");
        }
        Command::Rm { image, name } => {
            let (fs, nand) = mount_image(geo, &image)?;
            fs.remove(&name)?;
            save_image(&nand, &image)?;
            eprintln!("removed {name}");
        }
    }
    Ok(())
}

fn load_image(geo: Geometry, path: &Path) -> Result<MemNand> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    MemNand::from_image(geo, &bytes)
        .with_context(|| format!("{} does not match the given geometry", path.display()))
}

fn save_image(nand: &MemNand, path: &Path) -> Result<()> {
    std::fs::write(path, nand.to_image()).with_context(|| format!("writing {}", path.display()))
}

fn mount_image(geo: Geometry, path: &Path) -> Result<(Flogfs, MemNand)> {
    let nand = load_image(geo, path)?;
    let fs = Flogfs::new(Arc::new(nand.clone()))?;
    fs.mount().context("mount failed; is the image formatted?")?;
    Ok((fs, nand))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trip_through_files() {
        let geo = Geometry::new(512, 4, 2, 8).expect("geometry");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("media.flog");

        let nand = MemNand::new(geo);
        let fs = Flogfs::new(Arc::new(nand.clone())).expect("new");
        fs.format().expect("format");
        fs.mount().expect("mount");
        let h = fs.open_write("boot.log").expect("open");
        assert_eq!(fs.write(&h, b"first boot").expect("write"), 10);
        fs.close_write(h).expect("close");
        save_image(&nand, &path).expect("save");

        let (fs2, _nand2) = mount_image(geo, &path).expect("mount image");
        let files = fs2.list().expect("list");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "boot.log");

        let h = fs2.open_read("boot.log").expect("open_read");
        let mut buf = [0_u8; 32];
        let n = fs2.read(&h, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"first boot");
        fs2.close_read(h).expect("close_read");
    }
}
