//! Keygen command - write a new SSH host key

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

use crate::cli::args::KeygenArgs;
use crate::ssh::HostKey;

/// Execute the keygen command
pub async fn execute(args: KeygenArgs) -> Result<()> {
    let fingerprint = generate(&args.output, args.force)?;
    println!("Wrote {}", args.output.display());
    println!("Fingerprint: {}", fingerprint);
    Ok(())
}

/// Write `path` and `path.pub`, returning the key's fingerprint
fn generate(path: &Path, force: bool) -> Result<String> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if force && path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }

    let key = HostKey::generate().context("Failed to generate host key")?;
    key.write(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let public_path = public_key_path(path);
    let public = key.public_openssh()?;
    std::fs::write(&public_path, format!("{}\n", public))
        .with_context(|| format!("Failed to write {}", public_path.display()))?;

    Ok(key.fingerprint())
}

fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_writes_loadable_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys").join("host_ed25519");

        let fingerprint = generate(&path, false).unwrap();
        assert!(fingerprint.starts_with("SHA256:"));

        let loaded = HostKey::load(&path).unwrap();
        assert_eq!(loaded.fingerprint(), fingerprint);

        let public = std::fs::read_to_string(public_key_path(&path)).unwrap();
        assert!(public.starts_with("ssh-ed25519 "));
    }

    #[test]
    fn test_generate_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("host_ed25519");

        let first = generate(&path, false).unwrap();
        assert!(generate(&path, false).is_err());

        let second = generate(&path, true).unwrap();
        assert_ne!(first, second);
    }
}
