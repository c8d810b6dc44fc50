use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::extract::multipart::Field;
use gemlog_api::{Uuid, UPLOADS_PREFIX};
use tokio::io::AsyncWriteExt;

use crate::Error;

/// Local directory holding uploaded files
///
/// Files are referred to by the url they are served under, eg.
/// `/uploads/1666094400000-2c0b...c1.png`, which is what gets stored in the db.
#[derive(Clone, Debug)]
pub struct Uploads {
    dir: PathBuf,
}

impl Uploads {
    pub async fn open(dir: PathBuf) -> anyhow::Result<Uploads> {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating upload directory {:?}", dir))?;
        Ok(Uploads { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes an uploaded file to disk, returning its reference
    ///
    /// A file that could not be written completely is removed again.
    pub async fn store(&self, field: &mut Field<'_>) -> Result<String, Error> {
        let name = stored_name(field.file_name());
        let path = self.dir.join(&name);
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating upload file {:?}", path))?;
        if let Err(e) = write_field(file, field, &path).await {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(?path, ?err, "failed removing partial upload");
            }
            return Err(e);
        }
        tracing::debug!(?path, "stored upload");
        Ok(format!("{UPLOADS_PREFIX}/{name}"))
    }

    /// Deletes the file behind a reference; files already gone are not an error
    pub async fn remove(&self, reference: &str) -> anyhow::Result<()> {
        let Some(name) = local_name(reference) else {
            tracing::warn!(reference, "ignoring removal of a foreign upload reference");
            return Ok(());
        };
        let path = self.dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing upload file {:?}", path)),
        }
    }

    pub async fn remove_all(&self, references: &[String]) -> anyhow::Result<()> {
        for r in references {
            self.remove(r).await?;
        }
        Ok(())
    }
}

pub fn malformed_upload(err: impl std::fmt::Display) -> Error {
    Error::validation(&format!("Malformed upload: {err}"))
}

async fn write_field(
    mut file: tokio::fs::File,
    field: &mut Field<'_>,
    path: &Path,
) -> Result<(), Error> {
    while let Some(chunk) = field.chunk().await.map_err(malformed_upload)? {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing upload file {:?}", path))?;
    }
    file.flush()
        .await
        .with_context(|| format!("flushing upload file {:?}", path))?;
    Ok(())
}

fn stored_name(original: Option<&str>) -> String {
    let ext = original
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 10 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    format!(
        "{}-{}{}",
        chrono::Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        ext
    )
}

/// File name of a reference, refusing anything that could escape the upload directory
fn local_name(reference: &str) -> Option<&str> {
    let name = Path::new(reference).file_name()?.to_str()?;
    match name.starts_with('.') {
        true => None,
        false => Some(name),
    }
}
