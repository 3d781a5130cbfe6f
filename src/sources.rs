use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Check that a URL plausibly serves a still image: http(s) scheme and an
/// image extension on the path (query strings are fine).
pub fn validate_image_url(text: &str) -> Result<Url> {
    let url = Url::parse(text).with_context(|| format!("invalid camera URL {text:?}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("camera URL {text:?} must use http or https");
    }
    let path = url.path().to_ascii_lowercase();
    let has_image_ext = IMAGE_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(&format!(".{ext}")));
    if !has_image_ext {
        bail!("camera URL {text:?} does not point at an image");
    }
    Ok(url)
}

/// Where capture jobs get their bytes from. The scheduler core only ever
/// sees this trait; the network lives behind it.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &Url, auth: Option<(&str, &str)>) -> Result<Vec<u8>>;
}

pub struct HttpImageSource {
    client: reqwest::Client,
}

impl HttpImageSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &Url, auth: Option<(&str, &str)>) -> Result<Vec<u8>> {
        let mut request = self.client.get(url.clone());
        if let Some((user, password)) = auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("camera at {url} answered {status}"));
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading image body from {url} failed"))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_image_urls() {
        assert!(validate_image_url("http://cam.local/snapshot.jpg").is_ok());
        assert!(validate_image_url("https://cam.local/still.PNG").is_ok());
        assert!(validate_image_url("http://cam.local/img.jpeg?ts=1").is_ok());
    }

    #[test]
    fn rejects_non_image_urls() {
        assert!(validate_image_url("http://cam.local/stream").is_err());
        assert!(validate_image_url("http://cam.local/page.html").is_err());
        assert!(validate_image_url("ftp://cam.local/snapshot.jpg").is_err());
        assert!(validate_image_url("cam.local/snapshot.jpg").is_err());
    }
}
