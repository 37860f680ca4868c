//! Write a default `leasehold.toml`.
//!
//! The core logic takes closures for filesystem access so it can be tested
//! without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Writes the config template into `dir`.
pub(crate) fn run(dir: &Path, force: bool) -> Result<()> {
    info!("Initializing leasehold in {}", dir.display());

    let file = InitFile {
        path: PathBuf::from(CONFIG_FILE),
        content: templates::LEASEHOLD_TOML,
    };
    let result = init_file(
        &file,
        force,
        |path| dir.join(path).exists(),
        |path, content| {
            fs::write(dir.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_result(&file.path, result));
    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_file<E, W>(file: &InitFile, force: bool, exists: E, mut write_file: W) -> Result<WriteResult>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let existed = exists(&file.path);
    if existed && !force {
        return Ok(WriteResult::Skipped);
    }
    write_file(&file.path, file.content)?;
    Ok(if existed {
        WriteResult::Overwritten
    } else {
        WriteResult::Created
    })
}

fn format_result(path: &Path, result: WriteResult) -> String {
    let path = path.display().to_string();
    match result {
        WriteResult::Created => format!(
            "{} Created {}\n\nNext: pick a provider under {} and run {}\n",
            "✓".green().bold(),
            path.cyan(),
            "[provider]".yellow(),
            "leasehold session get <thread_id>".green()
        ),
        WriteResult::Overwritten => format!("{} {} (overwritten)\n", "↻".blue(), path),
        WriteResult::Skipped => format!(
            "{} {} (already exists, use --force to overwrite)\n",
            "⊘".yellow(),
            path
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn template() -> InitFile {
        InitFile {
            path: PathBuf::from(CONFIG_FILE),
            content: templates::LEASEHOLD_TOML,
        }
    }

    #[test]
    fn test_creates_missing_file() {
        let written = RefCell::new(Vec::new());
        let result = init_file(&template(), false, |_| false, |path, _| {
            written.borrow_mut().push(path.to_path_buf());
            Ok(())
        })
        .unwrap();
        assert_eq!(result, WriteResult::Created);
        assert_eq!(*written.borrow(), vec![PathBuf::from("leasehold.toml")]);
    }

    #[test]
    fn test_skips_existing_without_force() {
        let written = RefCell::new(0);
        let result = init_file(&template(), false, |_| true, |_, _| {
            *written.borrow_mut() += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(result, WriteResult::Skipped);
        assert_eq!(*written.borrow(), 0);
    }

    #[test]
    fn test_overwrites_with_force() {
        let result = init_file(&template(), true, |_| true, |_, _| Ok(())).unwrap();
        assert_eq!(result, WriteResult::Overwritten);
    }

    #[test]
    fn test_write_error_propagates() {
        let result = init_file(&template(), false, |_| false, |_, _| {
            anyhow::bail!("disk full")
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_format_result() {
        let path = Path::new("leasehold.toml");
        assert!(format_result(path, WriteResult::Created).contains("leasehold session get"));
        assert!(format_result(path, WriteResult::Skipped).contains("--force"));
        assert!(format_result(path, WriteResult::Overwritten).contains("overwritten"));
    }
}
