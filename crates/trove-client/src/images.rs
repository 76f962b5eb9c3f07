use std::path::{Path, PathBuf};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use sha2::{Digest, Sha256};
use trove_core::error::AppError;
use trove_core::traits::{FetchedImage, ImageFetcher, ImageStore};
use url::Url;

use crate::guard::ensure_public_url;

const JPEG_QUALITY: u8 = 85;
const MAX_REDIRECTS: usize = 5;

/// Downloads product images over HTTP.
///
/// Scraped image references are untrusted, so by default every URL is
/// checked with [`ensure_public_url`] first. Redirects are followed by hand
/// so that each hop goes through the same check. Use
/// [`allow_private_urls`](Self::allow_private_urls) for local testing.
#[derive(Clone)]
pub struct HttpImageFetcher {
    client: Client,
    timeout_secs: u64,
    max_bytes: usize,
    ssrf_protection: bool,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent("Trove/0.1 (image fetch)")
            .timeout(timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            max_bytes,
            ssrf_protection: true,
        })
    }

    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn check(&self, url: &str) -> Result<Url, AppError> {
        if self.ssrf_protection {
            ensure_public_url(url).await
        } else {
            Url::parse(url).map_err(|e| AppError::ValidationError(format!("Invalid URL '{url}': {e}")))
        }
    }

    /// Resolve a redirect `location` against `current` and vet the result.
    async fn redirect_target(&self, current: &Url, location: &str) -> Result<Url, AppError> {
        let next = current
            .join(location)
            .map_err(|e| AppError::HttpError(format!("Bad redirect from {current} to '{location}': {e}")))?;
        self.check(next.as_str()).await
    }

    fn request_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }

    fn too_large(&self, size: usize, url: &str) -> AppError {
        AppError::ImageError(format!(
            "Image {url} is {size} bytes (limit {})",
            self.max_bytes
        ))
    }
}

impl ImageFetcher for HttpImageFetcher {
    async fn fetch_image(&self, url: &str) -> Result<FetchedImage, AppError> {
        let mut target = self.check(url).await?;
        let mut redirects = 0;
        let response = loop {
            let response = self
                .client
                .get(target.clone())
                .send()
                .await
                .map_err(|e| self.request_error(e))?;
            if !response.status().is_redirection() {
                break response;
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    AppError::HttpError(format!("Redirect without location for {url}"))
                })?;
            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(AppError::HttpError(format!("Too many redirects for {url}")));
            }
            target = self.redirect_target(&target, location).await?;
        };

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        if let Some(ct) = &content_type
            && !ct.starts_with("image/")
        {
            return Err(AppError::ImageError(format!(
                "{url} is not an image (content-type {ct})"
            )));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.max_bytes
        {
            return Err(self.too_large(len as usize, url));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read image body: {e}")))?;
        if bytes.len() > self.max_bytes {
            return Err(self.too_large(bytes.len(), url));
        }

        Ok(FetchedImage {
            url: url.to_string(),
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

/// Stores normalised JPEGs on disk, addressed by content hash.
///
/// Layout: `<root>/<first two hex chars>/<sha256>.jpg`. Storing the same
/// picture twice yields the same path.
#[derive(Debug, Clone)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageStore for FsImageStore {
    async fn store(&self, image: FetchedImage, max_dimension: u32) -> Result<String, AppError> {
        let source = image.url;
        let jpeg = tokio::task::spawn_blocking(move || normalize(&image.bytes, max_dimension))
            .await
            .map_err(|e| AppError::Generic(format!("Image task failed: {e}")))??;

        let digest = format!("{:x}", Sha256::digest(&jpeg));
        let dir = self.root.join(&digest[..2]);
        let path = dir.join(format!("{digest}.jpg"));

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path.to_string_lossy().into_owned());
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::ImageError(format!("Failed to create {}: {e}", dir.display())))?;
        tokio::fs::write(&path, &jpeg)
            .await
            .map_err(|e| AppError::ImageError(format!("Failed to write {}: {e}", path.display())))?;

        tracing::debug!(url = %source, path = %path.display(), bytes = jpeg.len(), "Stored image");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Decode, flatten to RGB, downscale to fit `max_dimension`, and re-encode as JPEG.
fn normalize(bytes: &[u8], max_dimension: u32) -> Result<Vec<u8>, AppError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| AppError::ImageError(format!("Undecodable image: {e}")))?;

    let (width, height) = decoded.dimensions();
    let fitted = if max_dimension > 0 && width.max(height) > max_dimension {
        decoded.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        decoded
    };
    let rgb = DynamicImage::ImageRgb8(fitted.to_rgb8());

    let mut out = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
        .map_err(|e| AppError::ImageError(format!("JPEG encoding failed: {e}")))?;
    Ok(out)
}
