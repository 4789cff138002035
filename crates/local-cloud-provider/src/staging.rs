//! Staging of worker files.
//!
//! Turns a template source (a directory or a `.zip` archive) into a private
//! working copy for one instance and rewrites the worker's configuration so
//! it connects to the right server and reports the right identity.
//!
//! Layout of a staged worker:
//!
//! ```text
//! <staging_dir>/
//!   bin/agent.sh | bin/agent.bat     entry point, see `runner`
//!   conf/buildAgent.properties       rewritten by `write_worker_config`
//!   work/ temp/ system/              created by the worker, never copied
//! ```

use std::path::{Component, Path, PathBuf};

use local_cloud_core::params::{INSTANCE_ID_PARAM, TEMPLATE_ID_PARAM};
use local_cloud_core::{InstanceId, TemplateId};
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::properties::PropertiesFile;
use crate::types::ProvisionRequest;

/// Top-level template directories holding runtime state of a previous run.
pub const EXCLUDED_DIRS: [&str; 4] = ["work", "temp", "system", "contrib"];

/// Directory holding the worker configuration.
pub const CONF_DIR: &str = "conf";

/// Live worker configuration file.
pub const CONFIG_FILE: &str = "buildAgent.properties";

/// Distributed default configuration, used when no live config exists.
pub const DIST_CONFIG_FILE: &str = "buildAgent.dist.properties";

/// Suffix accepted for archive templates.
pub const ARCHIVE_SUFFIX: &str = ".zip";

/// Kind of template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A directory copied recursively.
    Directory,
    /// A `.zip` archive extracted in place.
    Archive,
}

/// Classify a template source path.
///
/// Returns `None` if the path is neither an existing directory nor an
/// existing file whose name ends in `.zip`.
#[must_use]
pub fn source_kind(path: &Path) -> Option<SourceKind> {
    if path.is_dir() {
        return Some(SourceKind::Directory);
    }
    let is_archive = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(ARCHIVE_SUFFIX));
    (path.is_file() && is_archive).then_some(SourceKind::Archive)
}

/// Copy or extract a template source into a staging directory.
///
/// The top-level [`EXCLUDED_DIRS`] are skipped. Existing files in the
/// staging directory are overwritten.
///
/// # Errors
///
/// Returns an error if the source is invalid or the copy fails.
pub fn materialize(source: &Path, staging_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(staging_dir)
        .map_err(|e| ProviderError::io(format!("create {}", staging_dir.display()), e))?;

    match source_kind(source) {
        Some(SourceKind::Directory) => copy_template_dir(source, staging_dir),
        Some(SourceKind::Archive) => extract_template_archive(source, staging_dir),
        None => Err(ProviderError::io(
            format!("stage {}", source.display()),
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "template source is not a directory or a zip archive",
            ),
        )),
    }?;

    debug!(
        source = %source.display(),
        staging_dir = %staging_dir.display(),
        "Materialized template"
    );
    Ok(())
}

/// Returns true if a path relative to the template root lies in an excluded
/// top-level directory.
fn is_excluded(rel: &Path, is_dir: bool) -> bool {
    let mut components = rel.components();
    let Some(Component::Normal(first)) = components.next() else {
        return false;
    };
    // A top-level file that happens to be named `work` is still staged.
    let nested = components.next().is_some();
    (nested || is_dir) && first.to_str().is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

fn copy_template_dir(src: &Path, dst: &Path) -> Result<()> {
    let walker = walkdir::WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1
                || !is_excluded(Path::new(entry.file_name()), entry.file_type().is_dir())
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let context = format!("walk {}", src.display());
            match e.into_io_error() {
                Some(io) => ProviderError::io(context, io),
                None => ProviderError::io(context, std::io::Error::other("filesystem loop")),
            }
        })?;
        let path = entry.path();
        if path == src {
            continue;
        }
        let rel = path.strip_prefix(src).map_err(|e| {
            ProviderError::io(
                format!("strip prefix {} from {}", src.display(), path.display()),
                std::io::Error::other(e),
            )
        })?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| ProviderError::io(format!("create {}", target.display()), e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError::io(format!("create {}", parent.display()), e))?;
        }
        std::fs::copy(path, &target).map_err(|e| {
            ProviderError::io(
                format!("copy {} -> {}", path.display(), target.display()),
                e,
            )
        })?;
    }
    Ok(())
}

fn extract_template_archive(zip_path: &Path, out_dir: &Path) -> Result<()> {
    let buf = std::fs::read(zip_path)
        .map_err(|e| ProviderError::io(format!("read {}", zip_path.display()), e))?;
    let archive = rawzip::ZipArchive::from_slice(&buf)
        .map_err(|e| ProviderError::Archive(format!("invalid zip archive: {e:?}")))?;

    for entry in archive.entries() {
        let entry = entry.map_err(|e| ProviderError::Archive(format!("zip entry error: {e:?}")))?;
        let filename = entry
            .file_path()
            .try_normalize()
            .map_err(|e| ProviderError::Archive(format!("failed to normalize zip path: {e:?}")))?
            .as_ref()
            .to_string();

        let rel = PathBuf::from(&filename);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(ProviderError::Archive(format!(
                "unsupported path in zip: {filename}"
            )));
        }
        if is_excluded(&rel, entry.is_dir()) {
            continue;
        }

        let out_path = out_dir.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| ProviderError::io(format!("create {}", out_path.display()), e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProviderError::io(format!("create {}", parent.display()), e))?;
        }

        let mut out = std::fs::File::create(&out_path)
            .map_err(|e| ProviderError::io(format!("create {}", out_path.display()), e))?;
        let slice_entry = archive
            .get_entry(entry.wayfinder())
            .map_err(|e| ProviderError::Archive(format!("failed to get entry data: {e:?}")))?;
        let data = slice_entry.data();
        let copied = match entry.compression_method() {
            rawzip::CompressionMethod::Store => std::io::copy(&mut &*data, &mut out),
            rawzip::CompressionMethod::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(data);
                std::io::copy(&mut decoder, &mut out)
            }
            method => {
                return Err(ProviderError::Archive(format!(
                    "unsupported compression method: {method:?}"
                )));
            }
        };
        copied.map_err(|e| {
            ProviderError::io(format!("extract {filename} to {}", out_path.display()), e)
        })?;
    }
    mark_scripts_executable(&out_dir.join("bin"))
}

/// Archives do not reliably carry unix permissions; entry scripts need `+x`.
#[cfg(unix)]
fn mark_scripts_executable(bin_dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(entries) = std::fs::read_dir(bin_dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sh") {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| ProviderError::io(format!("chmod {}", path.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn mark_scripts_executable(_bin_dir: &Path) -> Result<()> {
    Ok(())
}

/// Path of the live worker configuration inside a staging directory.
#[must_use]
pub fn config_path(staging_dir: &Path) -> PathBuf {
    staging_dir.join(CONF_DIR).join(CONFIG_FILE)
}

/// Rewrite the staged worker configuration for one instance.
///
/// Reads the live configuration if present, else the distributed default,
/// else starts empty. Always writes the live configuration.
///
/// # Errors
///
/// Returns an error if the configuration cannot be read or written.
pub fn write_worker_config(
    staging_dir: &Path,
    request: &ProvisionRequest,
    template_id: &TemplateId,
    instance_id: &InstanceId,
) -> Result<PathBuf> {
    let out_path = config_path(staging_dir);
    let dist_path = staging_dir.join(CONF_DIR).join(DIST_CONFIG_FILE);

    let mut config = if out_path.is_file() {
        PropertiesFile::load(&out_path)?
    } else if dist_path.is_file() {
        PropertiesFile::load(&dist_path)?
    } else {
        PropertiesFile::new()
    };

    config.set("name", request.agent_name.as_str());
    config.set("serverUrl", request.server_address.as_str());
    config.set("workDir", "../work");
    config.set("tempDir", "../temp");
    config.set("systemDir", "../system");
    config.set("authorizationToken", request.auth_token.as_str());
    for (key, value) in &request.custom_parameters {
        config.set(key.as_str(), value.as_str());
    }
    config.set(TEMPLATE_ID_PARAM, template_id.as_str());
    config.set(INSTANCE_ID_PARAM, instance_id.as_str());

    config.store(&out_path)?;
    Ok(out_path)
}

/// Remove a staging directory. A directory that is already gone is fine.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_staging_dir(staging_dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(staging_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProviderError::io(
            format!("remove {}", staging_dir.display()),
            e,
        )),
    }
}
