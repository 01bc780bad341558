#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sfs::{DirEntry, FsOptions, FsUsage, MkfsOptions, create_image, open_image};
use std::env;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ListOutput<'a> {
    path: &'a str,
    entries: Vec<DirEntry>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(image) = args.next() else {
                bail!("mkfs requires an <image> argument");
            };
            let mut options = MkfsOptions::default();
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--blocks" => {
                        let Some(value) = args.next() else {
                            bail!("--blocks requires a value");
                        };
                        options.block_count = value
                            .parse()
                            .with_context(|| format!("invalid block count: {value}"))?;
                    }
                    other => bail!("unknown mkfs option: {other}"),
                }
            }
            mkfs_cmd(Path::new(&image), &options)
        }
        "mkdir" => {
            let Some(image) = args.next() else {
                bail!("mkdir requires <image> <path>...");
            };
            let paths: Vec<String> = args.collect();
            if paths.is_empty() {
                bail!("mkdir requires at least one <path>");
            }
            mkdir_cmd(Path::new(&image), &paths)
        }
        "ls" => {
            let Some(image) = args.next() else {
                bail!("ls requires an <image> argument");
            };
            let mut json = false;
            let mut path = None;
            for arg in args {
                if arg == "--json" {
                    json = true;
                } else if path.is_none() {
                    path = Some(arg);
                } else {
                    bail!("unexpected argument: {arg}");
                }
            }
            ls_cmd(Path::new(&image), path.as_deref().unwrap_or("/"), json)
        }
        "inspect" => {
            let Some(image) = args.next() else {
                bail!("inspect requires an <image> argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect_cmd(Path::new(&image), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sfs-cli\n");
    println!("USAGE:");
    println!("  sfs-cli mkfs <image> [--blocks N]");
    println!("  sfs-cli mkdir <image> <path>...");
    println!("  sfs-cli ls <image> [path] [--json]");
    println!("  sfs-cli inspect <image> [--json]");
}

fn mkfs_cmd(image: &Path, options: &MkfsOptions) -> Result<()> {
    let fs = create_image(image, options, &FsOptions::default())
        .with_context(|| format!("failed to create image {}", image.display()))?;
    let usage = fs.usage().context("read usage")?;
    println!(
        "formatted {}: {} blocks of {} bytes, {} inodes",
        image.display(),
        usage.total_blocks,
        usage.block_size,
        usage.total_inodes
    );
    Ok(())
}

fn mkdir_cmd(image: &Path, paths: &[String]) -> Result<()> {
    let fs = open_image(image, &FsOptions::default())
        .with_context(|| format!("failed to open image {}", image.display()))?;
    for path in paths {
        let ino = fs
            .mkdir(path)
            .with_context(|| format!("mkdir {path}"))?;
        println!("{ino} {path}");
    }
    fs.sync().context("sync image")?;
    Ok(())
}

fn ls_cmd(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = open_image(image, &FsOptions::default())
        .with_context(|| format!("failed to open image {}", image.display()))?;
    let entries = fs.list_dir(path).with_context(|| format!("ls {path}"))?;

    if json {
        let output = ListOutput { path, entries };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        for entry in entries {
            println!("{} {}", entry.inode, entry.name);
        }
    }
    Ok(())
}

fn inspect_cmd(image: &Path, json: bool) -> Result<()> {
    let fs = open_image(image, &FsOptions::default())
        .with_context(|| format!("failed to open image {}", image.display()))?;
    let usage: FsUsage = fs.usage().context("read usage")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&usage).context("serialize output")?
        );
    } else {
        println!("SimFS Inspector");
        println!("block_size: {}", usage.block_size);
        println!("blocks: {} ({} free)", usage.total_blocks, usage.free_blocks);
        println!("inodes: {} ({} free)", usage.total_inodes, usage.free_inodes);
        println!("cache_slots: {}", usage.cache_slots);
    }
    Ok(())
}
