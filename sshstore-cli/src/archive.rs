//! `sshstore export` and `sshstore import`.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sshstore::{ImportStatus, NarHash, NarHasher, PathInfo, SshStore, Store};
use sshstore_proto::nar;
use tokio::io::AsyncWriteExt;

/// Arguments for `sshstore export`.
#[derive(clap::Args)]
pub struct ExportArgs {
    /// Store path to export.
    path: String,

    /// Write the archive to a file instead of stdout.
    #[arg(short = 'o', long, conflicts_with = "unpack")]
    output: Option<PathBuf>,

    /// Restore the archive into a new directory.
    #[arg(long)]
    unpack: Option<PathBuf>,
}

/// Arguments for `sshstore import`.
#[derive(clap::Args)]
pub struct ImportArgs {
    /// Store path to register the archive under.
    path: String,

    /// Archive file to import.
    #[arg(long, conflicts_with = "from", required_unless_present = "from")]
    nar: Option<PathBuf>,

    /// Directory or file to archive and import.
    #[arg(long)]
    from: Option<PathBuf>,

    /// Store paths the imported path refers to.
    #[arg(long = "reference")]
    references: Vec<String>,

    /// Derivation that produced the path.
    #[arg(long)]
    deriver: Option<String>,

    /// Signatures to attach.
    #[arg(long = "sig")]
    signatures: Vec<String>,
}

pub async fn export(store: &SshStore, args: ExportArgs) -> Result<()> {
    let path = store.store_dir().parse(&args.path)?;

    if let Some(dest) = args.unpack {
        let mut buf = Vec::new();
        store.nar_from_path(&path, &mut buf).await?;
        nar::restore(&mut Cursor::new(buf), &dest)
            .with_context(|| format!("failed to unpack into {}", dest.display()))?;
        return Ok(());
    }

    let size = if let Some(out) = args.output {
        let mut file = tokio::fs::File::create(&out)
            .await
            .with_context(|| format!("failed to create {}", out.display()))?;
        let n = store.nar_from_path(&path, &mut file).await?;
        file.flush().await?;
        n
    } else {
        let mut stdout = tokio::io::stdout();
        let n = store.nar_from_path(&path, &mut stdout).await?;
        stdout.flush().await?;
        n
    };
    tracing::debug!(path = %args.path, size, "exported");
    Ok(())
}

pub async fn import(store: &SshStore, args: ImportArgs) -> Result<()> {
    let dir = store.store_dir();
    let archive = read_archive(args.nar.as_deref(), args.from.as_deref())?;
    let (hash, size) = hash_archive(&archive);

    let mut info = PathInfo::new(dir.parse(&args.path)?).with_nar(hash, size);
    for r in &args.references {
        info = info.with_reference(dir.parse(r)?);
    }
    if let Some(d) = &args.deriver {
        info = info.with_deriver(dir.parse(d)?);
    }
    for s in args.signatures {
        info = info.with_signature(s);
    }

    match store.add_to_store(&info, &mut Cursor::new(archive)).await? {
        ImportStatus::Accepted => {
            println!("{}", dir.print(&info.path));
            Ok(())
        }
        ImportStatus::Rejected => anyhow::bail!("remote rejected {}", args.path),
        _ => anyhow::bail!("remote returned an unknown import status for {}", args.path),
    }
}

/// Loads an archive file or serializes a filesystem tree.
fn read_archive(nar_file: Option<&Path>, tree: Option<&Path>) -> Result<Vec<u8>> {
    match (nar_file, tree) {
        (Some(file), _) => {
            std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))
        }
        (None, Some(root)) => {
            let mut buf = Vec::new();
            nar::dump(root, &mut buf)
                .with_context(|| format!("failed to archive {}", root.display()))?;
            Ok(buf)
        }
        (None, None) => anyhow::bail!("one of --nar or --from is required"),
    }
}

fn hash_archive(archive: &[u8]) -> (NarHash, u64) {
    let mut hasher = NarHasher::default();
    hasher.update(archive);
    hasher.finish()
}
