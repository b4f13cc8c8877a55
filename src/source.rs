use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tracing::{debug, warn};

/// A video handed to the sampler by the caller.
///
/// The sampler only ever borrows a source. Whatever temporary file it needs
/// to decode in-memory bytes is created and removed by the decode surface.
#[derive(Debug)]
pub enum VideoSource {
    /// A file the caller owns.
    File(PathBuf),
    /// Raw bytes from an upload, tagged with their MIME type.
    Bytes { data: Vec<u8>, mime_type: String },
    /// A finished camera recording. The file is deleted when the source is dropped.
    Recording(TempPath),
}

impl VideoSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        VideoSource::File(path.into())
    }

    pub fn from_bytes(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        VideoSource::Bytes {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            VideoSource::File(path) => path.display().to_string(),
            VideoSource::Bytes { data, mime_type } => {
                format!("<{} bytes of {}>", data.len(), mime_type)
            }
            VideoSource::Recording(path) => format!("recording {}", path.display()),
        }
    }

    /// Resolve the source to a path the decoder can open, writing bytes out
    /// to a temporary file when needed.
    pub(crate) fn materialize(&self) -> io::Result<MediaPath> {
        match self {
            VideoSource::File(path) => Ok(MediaPath::borrowed(path)),
            VideoSource::Recording(path) => Ok(MediaPath::borrowed(path)),
            VideoSource::Bytes { data, mime_type } => {
                let mut file = tempfile::Builder::new()
                    .prefix("vidspec-")
                    .suffix(extension_for(mime_type))
                    .tempfile()?;
                file.write_all(data)?;
                file.flush()?;
                let temp = file.into_temp_path();
                debug!(path = %temp.display(), "wrote video bytes to temporary file");
                Ok(MediaPath {
                    path: temp.to_path_buf(),
                    temp: Some(temp),
                })
            }
        }
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type.split(';').next().unwrap_or_default().trim() {
        "video/webm" => ".webm",
        "video/mp4" => ".mp4",
        "video/quicktime" => ".mov",
        "video/x-matroska" => ".mkv",
        "video/x-msvideo" => ".avi",
        "video/ogg" => ".ogv",
        _ => ".bin",
    }
}

/// A decodable path plus the temporary file backing it, if any.
#[derive(Debug)]
pub(crate) struct MediaPath {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl MediaPath {
    fn borrowed(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            temp: None,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Delete the temporary file, if this path owns one.
    pub(crate) fn release(self) {
        if let Some(temp) = self.temp {
            let path = temp.to_path_buf();
            match temp.close() {
                Ok(()) => debug!(path = %path.display(), "removed temporary video file"),
                Err(err) => warn!(path = %path.display(), %err, "failed to remove temporary video file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_written_to_a_temporary_file_and_removed_on_release() {
        let source = VideoSource::from_bytes(vec![1, 2, 3, 4], "video/webm");
        let media = source.materialize().unwrap();
        assert!(media.is_temporary());
        assert!(media.path().extension().is_some_and(|ext| ext == "webm"));
        assert_eq!(std::fs::read(media.path()).unwrap(), vec![1, 2, 3, 4]);

        let path = media.path().to_path_buf();
        media.release();
        assert!(!path.exists());
    }

    #[test]
    fn caller_files_are_never_deleted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let source = VideoSource::from_path(file.path());
        let media = source.materialize().unwrap();
        assert!(!media.is_temporary());
        media.release();
        assert!(file.path().exists());
    }

    #[test]
    fn unknown_mime_types_get_a_neutral_extension() {
        assert_eq!(extension_for("video/webm;codecs=vp9"), ".webm");
        assert_eq!(extension_for("application/octet-stream"), ".bin");
    }
}
